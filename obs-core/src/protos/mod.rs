//! Generated OpenBikeSensor event messages (see `obs.proto`).

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
