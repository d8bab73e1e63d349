//! # OBS Core
//!
//! Platform-independent OpenBikeSensor protocol library.
//!
//! This crate contains pure parsing and protocol logic with **zero I/O dependencies**.
//! Time is always passed in by the caller as milliseconds, so every state
//! machine here can be driven from tests without a clock or a radio.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  obs-core (platform-independent, no tokio/async deps)       │
//! │  ├── cobs         (zero-free framing)                       │
//! │  ├── protocol/    (Lite protobuf events, Classic packets)   │
//! │  ├── window       (closest approach over 5 s)               │
//! │  ├── pipeline     (swap, gating, correction)                │
//! │  ├── connection   (link state machine, watchdog)            │
//! │  └── throttle     (preview rate limit)                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                ┌─────────────┴─────────────┐
//!                │  obs-recorder             │
//!                │  (radio, files, runtime)  │
//!                └───────────────────────────┘
//! ```
//!
//! ## Supported Sensors
//!
//! | Generation | Wire format                                   |
//! |------------|-----------------------------------------------|
//! | Lite       | protobuf `Event`, COBS framed, one per notify |
//! | Classic    | 8-byte distance packets, button notify        |
//!
//! ## Example: Decoding a Classic Packet
//!
//! ```rust
//! use obs_core::protocol::classic;
//!
//! let packet = classic::parse_packet(&[0xe8, 0x03, 0, 0, 0x64, 0, 0x2c, 0x01]).unwrap();
//! assert_eq!(packet.clock_ms, 1000);
//! assert_eq!(packet.left_cm, Some(100));
//! assert_eq!(packet.right_cm, Some(300));
//! ```
//!
//! ## Example: Closest Approach
//!
//! ```rust
//! use obs_core::{DistanceSample, PairedWindow, SensorSource};
//!
//! let mut window = PairedWindow::new(5_000);
//! window.add(DistanceSample { source: SensorSource::Left, corrected_cm: 80, timestamp_ms: 0 });
//! window.add(DistanceSample { source: SensorSource::Left, corrected_cm: 50, timestamp_ms: 2_000 });
//! assert_eq!(window.press(3_000).left_cm, Some(50));
//! ```

pub mod cobs;
pub mod connection;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod protos;
pub mod throttle;
pub mod window;

// Re-export commonly used types
pub use connection::{
    ConnectionManager, ConnectionState, DisconnectReason, DiscoveryOutcome, LinkTimeouts,
    PendingResume, ReconnectPlan, WatchdogVerdict,
};
pub use device::{DeviceId, DeviceIdentity, DeviceType};
pub use error::ParseError;
pub use pipeline::{
    ClassicRow, Location, Output, OvertakeEvent, Pipeline, PipelineConfig, PreviewUpdate, Record,
};
pub use throttle::Throttle;
pub use window::{DistanceSample, PairedWindow, PressMinimum, SensorSource, TimeWindow};
