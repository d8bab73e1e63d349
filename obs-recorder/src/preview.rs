//! Live preview state, published at most ten times per second.

use serde::Serialize;
use tokio::sync::watch;

use obs_core::connection::ConnectionState;
use obs_core::pipeline::{Location, OvertakeEvent, PreviewUpdate};
use obs_core::throttle::{Throttle, PREVIEW_INTERVAL_MS};
use obs_core::{DeviceType, SensorSource};

/// Latest reading of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SideReading {
    #[default]
    Unknown,
    Distance {
        cm: u16,
    },
    /// Sensor reports, but no echo
    NoSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewState {
    pub connection: ConnectionState,
    pub device_name: Option<String>,
    pub device_type: Option<DeviceType>,
    pub left: SideReading,
    pub right: SideReading,
    /// Closest approach on the overtaker side since the last press
    pub left_minimum_cm: Option<u16>,
    pub battery_percent: Option<f32>,
    pub location: Option<Location>,
    pub recording: bool,
    pub last_overtake: Option<OvertakeEvent>,
}

impl Default for PreviewState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::PoweredOff,
            device_name: None,
            device_type: None,
            left: SideReading::Unknown,
            right: SideReading::Unknown,
            left_minimum_cm: None,
            battery_percent: None,
            location: None,
            recording: false,
            last_overtake: None,
        }
    }
}

impl PreviewState {
    pub fn apply(&mut self, update: PreviewUpdate) {
        match update {
            PreviewUpdate::Distance { source, cm } => {
                *self.side_mut(source) = SideReading::Distance { cm };
            }
            PreviewUpdate::NoSignal { source } => {
                *self.side_mut(source) = SideReading::NoSignal;
            }
            PreviewUpdate::Battery { percentage, .. } => {
                self.battery_percent = Some(percentage);
            }
            PreviewUpdate::Location(location) => self.location = Some(location),
        }
    }

    /// Forget everything tied to the link.
    pub fn clear_link(&mut self) {
        self.device_name = None;
        self.device_type = None;
        self.left = SideReading::Unknown;
        self.right = SideReading::Unknown;
        self.left_minimum_cm = None;
        self.battery_percent = None;
    }

    fn side_mut(&mut self, source: SensorSource) -> &mut SideReading {
        match source {
            SensorSource::Left => &mut self.left,
            SensorSource::Right => &mut self.right,
        }
    }
}

/// Owns the preview state and pushes throttled snapshots into a watch channel.
pub struct PreviewPublisher {
    state: PreviewState,
    throttle: Throttle<PreviewState>,
    tx: watch::Sender<PreviewState>,
}

impl Default for PreviewPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PreviewState::default());
        Self {
            state: PreviewState::default(),
            throttle: Throttle::new(PREVIEW_INTERVAL_MS),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> &PreviewState {
        &self.state
    }

    /// Modify the state and offer a snapshot for publication.
    pub fn update<F>(&mut self, current_time_ms: u64, f: F)
    where
        F: FnOnce(&mut PreviewState),
    {
        f(&mut self.state);
        if let Some(snapshot) = self.throttle.offer(self.state.clone(), current_time_ms) {
            self.tx.send_replace(snapshot);
        }
    }

    /// Publish a coalesced snapshot if one is waiting.
    pub fn flush(&mut self, current_time_ms: u64) {
        if let Some(snapshot) = self.throttle.flush(current_time_ms) {
            self.tx.send_replace(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_updates() {
        let mut state = PreviewState::default();
        state.apply(PreviewUpdate::Distance {
            source: SensorSource::Left,
            cm: 120,
        });
        state.apply(PreviewUpdate::NoSignal {
            source: SensorSource::Right,
        });
        assert_eq!(state.left, SideReading::Distance { cm: 120 });
        assert_eq!(state.right, SideReading::NoSignal);

        state.clear_link();
        assert_eq!(state.left, SideReading::Unknown);
    }

    #[test]
    fn test_publication_is_throttled() {
        let mut publisher = PreviewPublisher::new();
        let rx = publisher.subscribe();

        publisher.update(0, |s| s.recording = true);
        assert!(rx.borrow().recording);

        publisher.update(10, |s| {
            s.apply(PreviewUpdate::Distance {
                source: SensorSource::Left,
                cm: 90,
            })
        });
        // Held back, not lost
        assert_eq!(rx.borrow().left, SideReading::Unknown);
        assert_eq!(publisher.state().left, SideReading::Distance { cm: 90 });

        publisher.flush(100);
        assert_eq!(rx.borrow().left, SideReading::Distance { cm: 90 });
    }

    #[test]
    fn test_serializes_for_display() {
        let json = serde_json::to_value(PreviewState::default()).unwrap();
        assert_eq!(json["connection"], "PoweredOff");
        assert_eq!(json["left"]["state"], "unknown");
    }
}
