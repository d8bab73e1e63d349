//! Sliding time windows over distance samples.
//!
//! The closest approach reported for an overtake is the minimum distance a
//! sensor saw during the last few seconds before the operator pressed the
//! button. A second press within the horizon only looks at samples recorded
//! after the first press, so one close pass is never reported twice.
//!
//! All timestamps are milliseconds on a monotonic clock supplied by the
//! caller, like the rest of this crate.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default horizon of a window (milliseconds)
pub const DEFAULT_HORIZON_MS: u64 = 5_000;

/// Logical distance source on the bicycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorSource {
    /// Source id 1, facing the overtaking traffic
    Left,
    /// Source id 2, facing parked cars and the curb
    Right,
}

impl SensorSource {
    /// Map a wire source id to a sensor. Ids other than 1 and 2 are unknown.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(SensorSource::Left),
            2 => Some(SensorSource::Right),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            SensorSource::Left => 1,
            SensorSource::Right => 2,
        }
    }

    pub fn other(self) -> Self {
        match self {
            SensorSource::Left => SensorSource::Right,
            SensorSource::Right => SensorSource::Left,
        }
    }
}

/// A single corrected distance reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceSample {
    pub source: SensorSource,
    pub corrected_cm: u16,
    pub timestamp_ms: u64,
}

/// Append-only, time-ordered buffer of values for one source.
#[derive(Debug, Clone)]
pub struct TimeWindow<T> {
    horizon_ms: u64,
    entries: VecDeque<(u64, T)>,
}

impl<T: Copy + Ord> TimeWindow<T> {
    pub fn new(horizon_ms: u64) -> Self {
        Self {
            horizon_ms,
            entries: VecDeque::new(),
        }
    }

    /// Append `value` observed at `now_ms` and drop expired entries.
    pub fn add(&mut self, now_ms: u64, value: T) {
        self.entries.push_back((now_ms, value));
        self.prune(now_ms);
    }

    /// Smallest value still inside the horizon at `now_ms`, optionally only
    /// considering entries strictly after `after_ms`.
    pub fn minimum(&mut self, now_ms: u64, after_ms: Option<u64>) -> Option<T> {
        self.prune(now_ms);
        self.entries
            .iter()
            .filter(|(ts, _)| after_ms.map_or(true, |cutoff| *ts > cutoff))
            .map(|(_, v)| *v)
            .min()
    }

    /// Number of entries inside the horizon at `now_ms`.
    pub fn len(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.entries.len()
    }

    pub fn is_empty(&mut self, now_ms: u64) -> bool {
        self.len(now_ms) == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // An entry exactly `horizon_ms` old is already outside the window.
    fn prune(&mut self, now_ms: u64) {
        while let Some(&(ts, _)) = self.entries.front() {
            if now_ms.saturating_sub(ts) >= self.horizon_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Result of evaluating a button press against both windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressMinimum {
    pub left_cm: Option<u16>,
    pub right_cm: Option<u16>,
}

/// Left and right windows plus the cutoff left behind by the last press.
#[derive(Debug, Clone)]
pub struct PairedWindow {
    left: TimeWindow<u16>,
    right: TimeWindow<u16>,
    last_press_ms: Option<u64>,
}

impl Default for PairedWindow {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON_MS)
    }
}

impl PairedWindow {
    pub fn new(horizon_ms: u64) -> Self {
        Self {
            left: TimeWindow::new(horizon_ms),
            right: TimeWindow::new(horizon_ms),
            last_press_ms: None,
        }
    }

    pub fn add(&mut self, sample: DistanceSample) {
        self.window_mut(sample.source)
            .add(sample.timestamp_ms, sample.corrected_cm);
    }

    /// Minimum of one source since the last press, without consuming the press.
    pub fn minimum(&mut self, source: SensorSource, now_ms: u64) -> Option<u16> {
        let cutoff = self.last_press_ms;
        self.window_mut(source).minimum(now_ms, cutoff)
    }

    /// Evaluate a button press at `now_ms` and re-arm the cutoff.
    ///
    /// The cutoff moves to `now_ms` whether or not a value was found.
    pub fn press(&mut self, now_ms: u64) -> PressMinimum {
        let cutoff = self.last_press_ms;
        let result = PressMinimum {
            left_cm: self.left.minimum(now_ms, cutoff),
            right_cm: self.right.minimum(now_ms, cutoff),
        };
        self.last_press_ms = Some(now_ms);
        result
    }

    pub fn last_press_ms(&self) -> Option<u64> {
        self.last_press_ms
    }

    /// Forget all samples and the press cutoff (new connection).
    pub fn reset(&mut self) {
        self.left.clear();
        self.right.clear();
        self.last_press_ms = None;
    }

    fn window_mut(&mut self, source: SensorSource) -> &mut TimeWindow<u16> {
        match source {
            SensorSource::Left => &mut self.left,
            SensorSource::Right => &mut self.right,
        }
    }
}
