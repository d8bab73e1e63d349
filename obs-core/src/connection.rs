//! Connection state machine for the sensor link.
//!
//! This module provides platform-independent connection state management.
//! The radio layer performs the actual scanning and connecting and reports
//! what happened; the manager decides what to do next.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConnectionManager (this module)                            │
//! │  - Pure state transitions, no I/O                           │
//! │  - Time is passed in as milliseconds                        │
//! └─────────────────────────────────────────────────────────────┘
//!                    │
//!                    ▼
//!          ┌───────────────────┐
//!          │ Link supervisor   │  owns the manager, talks to the radio,
//!          │ (obs-recorder)    │  runs the 1 Hz watchdog
//!          └───────────────────┘
//! ```
//!
//! ```text
//! PoweredOff → Scanning → Connecting → DiscoveringServices → Connected
//!                 ▲                                            │
//!                 │              ┌─────── Stale ◄──────────────┤
//!                 │              ▼                             │
//!                 ├──── ForcingDisconnect ◄────────────────────┤
//!                 └──── Disconnecting ◄────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use obs_core::connection::{ConnectionManager, ConnectionState, LinkTimeouts};
//! use obs_core::device::{DeviceId, DeviceIdentity, LITE_SERVICE};
//!
//! let mut conn = ConnectionManager::new(LinkTimeouts::default());
//! conn.powered_on(0);
//! assert_eq!(conn.state(), ConnectionState::Scanning);
//!
//! let device = DeviceIdentity {
//!     id: DeviceId("AA:BB".into()),
//!     name: None,
//!     advertised_name: Some("OBS Lite".into()),
//!     rssi: None,
//! };
//! assert!(conn.candidate_discovered(&device, true, "obs", 10));
//! conn.link_connected(20);
//! conn.services_discovered(&[LITE_SERVICE], 30);
//! assert_eq!(conn.state(), ConnectionState::Connected);
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceIdentity, DeviceType};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of the link to one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Radio unavailable
    PoweredOff,
    /// Looking for a matching device
    Scanning,
    /// Connect request issued
    Connecting,
    /// Link up, waiting for the service list
    DiscoveringServices,
    /// Notifications subscribed
    Connected,
    /// Connected, but the watchdog saw no data for too long
    Stale,
    /// Link is being torn down by the watchdog; scanning resumes after a delay
    ForcingDisconnect,
    /// Link lost or closed on request; scanning resumes after a delay
    Disconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::PoweredOff
    }
}

impl ConnectionState {
    /// Check if a link to a device exists or is being set up
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::Connected
                | ConnectionState::Stale
        )
    }

    /// Check if a recording session may exist in this state
    pub fn allows_recording(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Stale)
    }

    /// Check if a reconnect is scheduled
    pub fn is_tearing_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::ForcingDisconnect | ConnectionState::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::PoweredOff => write!(f, "Powered Off"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::DiscoveringServices => write!(f, "Discovering Services"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Stale => write!(f, "Stale"),
            ConnectionState::ForcingDisconnect => write!(f, "Forcing Disconnect"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why a link is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The radio reports the link down while we think it is up
    LinkLost,
    /// No notification within the stale timeout
    Stale,
    /// Services were not discovered in time
    DiscoveryTimeout,
    /// Neither sensor service is present
    Incompatible,
    /// Connect or discovery failed outright
    Error,
    /// Requested by the operator
    User,
}

impl DisconnectReason {
    /// Watchdog-initiated reasons tear down through `ForcingDisconnect`.
    pub fn is_forced(&self) -> bool {
        !matches!(self, DisconnectReason::Error | DisconnectReason::User)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LinkLost => write!(f, "link lost"),
            DisconnectReason::Stale => write!(f, "no data received"),
            DisconnectReason::DiscoveryTimeout => write!(f, "service discovery timed out"),
            DisconnectReason::Incompatible => write!(f, "incompatible device"),
            DisconnectReason::Error => write!(f, "connection error"),
            DisconnectReason::User => write!(f, "disconnect requested"),
        }
    }
}

// =============================================================================
// Timing
// =============================================================================

/// Stale timeout default (milliseconds)
pub const DEFAULT_STALE_AFTER_MS: u64 = 5_000;
/// Service discovery timeout default (milliseconds)
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5_000;
/// Delay before scanning resumes after a teardown (milliseconds)
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
/// Watchdog tick interval (milliseconds)
pub const WATCHDOG_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkTimeouts {
    pub stale_after_ms: u64,
    pub discovery_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

// =============================================================================
// Transition results
// =============================================================================

/// A recording that was stopped by a teardown and should start again on the
/// next successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResume {
    pub device_type: DeviceType,
}

/// Result of a service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Device classified; `resume` is set if a recording must restart
    Ready {
        device_type: DeviceType,
        resume: Option<PendingResume>,
    },
    /// Device refused, link torn down
    Incompatible(ReconnectPlan),
    /// Discovery result arrived in a state that does not expect it
    Ignored,
}

/// What the watchdog wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Nothing to do
    Healthy,
    /// Tear the link down. The caller stops any recording first, then calls
    /// [`ConnectionManager::begin_disconnect`].
    ForceDisconnect(DisconnectReason),
}

/// Delayed resume of scanning. Only the current episode is honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub episode: u64,
    pub delay_ms: u64,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Manages link state, the watchdog and reconnect episodes.
///
/// This is a pure state machine with no I/O - the radio operations are
/// performed by the caller.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    state: ConnectionState,
    timeouts: LinkTimeouts,
    /// Timestamp of last state change (milliseconds)
    last_state_change_ms: u64,
    /// When the current link reached `Connected`
    connected_at_ms: u64,
    last_notification_ms: Option<u64>,
    discovery_deadline_ms: Option<u64>,
    device: Option<DeviceIdentity>,
    device_type: Option<DeviceType>,
    /// Bumped on every teardown; stale reconnect timers compare against it
    episode: u64,
    pending_resume: Option<PendingResume>,
    /// Incompatible devices skipped for the rest of the current scan
    ignored: HashSet<DeviceId>,
    last_teardown: Option<DisconnectReason>,
}

impl ConnectionManager {
    /// Create a new connection manager in powered-off state.
    pub fn new(timeouts: LinkTimeouts) -> Self {
        ConnectionManager {
            state: ConnectionState::PoweredOff,
            timeouts,
            last_state_change_ms: 0,
            connected_at_ms: 0,
            last_notification_ms: None,
            discovery_deadline_ms: None,
            device: None,
            device_type: None,
            episode: 0,
            pending_resume: None,
            ignored: HashSet::new(),
            last_teardown: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn timeouts(&self) -> LinkTimeouts {
        self.timeouts
    }

    /// Device of the current (or last attempted) link.
    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    /// Generation of the connected device, known after discovery.
    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn pending_resume(&self) -> Option<PendingResume> {
        self.pending_resume
    }

    /// Drop a pending resume (the operator stopped recording meanwhile).
    pub fn cancel_resume(&mut self) -> Option<PendingResume> {
        self.pending_resume.take()
    }

    pub fn is_ignored(&self, id: &DeviceId) -> bool {
        self.ignored.contains(id)
    }

    /// Calculate time since last state change.
    pub fn time_in_state_ms(&self, current_time_ms: u64) -> u64 {
        current_time_ms.saturating_sub(self.last_state_change_ms)
    }

    /// Time since the last notification, or since connect if none arrived.
    pub fn time_since_data_ms(&self, current_time_ms: u64) -> u64 {
        let reference = self.last_notification_ms.unwrap_or(self.connected_at_ms);
        current_time_ms.saturating_sub(reference)
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// Radio became available. Starts scanning and forgets refused devices.
    pub fn powered_on(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::PoweredOff {
            self.ignored.clear();
            self.set_state(ConnectionState::Scanning, current_time_ms);
        }
    }

    /// Radio went away. Any link is gone; pending reconnects are void.
    pub fn powered_off(&mut self, current_time_ms: u64) {
        self.episode += 1;
        self.clear_link();
        self.set_state(ConnectionState::PoweredOff, current_time_ms);
    }

    /// A scan result arrived. Returns true if the caller should connect to it
    /// (scanning stops).
    pub fn candidate_discovered(
        &mut self,
        device: &DeviceIdentity,
        connectable: bool,
        name_filter: &str,
        current_time_ms: u64,
    ) -> bool {
        if self.state != ConnectionState::Scanning
            || !connectable
            || self.ignored.contains(&device.id)
            || !device.matches(name_filter)
        {
            return false;
        }
        self.device = Some(device.clone());
        // Connect shares the discovery timeout
        self.discovery_deadline_ms = Some(current_time_ms + self.timeouts.discovery_timeout_ms);
        self.set_state(ConnectionState::Connecting, current_time_ms);
        true
    }

    /// The link is up; service discovery starts and its deadline is re-armed.
    pub fn link_connected(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::Connecting {
            self.discovery_deadline_ms =
                Some(current_time_ms + self.timeouts.discovery_timeout_ms);
            self.set_state(ConnectionState::DiscoveringServices, current_time_ms);
        }
    }

    /// Classify the device from its services.
    ///
    /// On success the link is `Connected` and any pending resume is handed
    /// out (and cleared). An incompatible device is remembered and the link
    /// is torn down.
    pub fn services_discovered<S: AsRef<str>>(
        &mut self,
        services: &[S],
        current_time_ms: u64,
    ) -> DiscoveryOutcome {
        if self.state != ConnectionState::DiscoveringServices {
            return DiscoveryOutcome::Ignored;
        }
        self.discovery_deadline_ms = None;

        match DeviceType::classify(services) {
            Some(device_type) => {
                self.device_type = Some(device_type);
                self.connected_at_ms = current_time_ms;
                self.last_notification_ms = None;
                self.set_state(ConnectionState::Connected, current_time_ms);
                DiscoveryOutcome::Ready {
                    device_type,
                    resume: self.pending_resume.take(),
                }
            }
            None => {
                if let Some(device) = &self.device {
                    self.ignored.insert(device.id.clone());
                }
                let plan =
                    self.begin_disconnect(DisconnectReason::Incompatible, None, current_time_ms);
                DiscoveryOutcome::Incompatible(plan)
            }
        }
    }

    /// Record that a notification arrived.
    pub fn notification_received(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::Connected {
            self.last_notification_ms = Some(current_time_ms);
        }
    }

    /// Periodic check, called once per second with the radio's view of the link.
    pub fn watchdog_tick(&mut self, current_time_ms: u64, link_up: bool) -> WatchdogVerdict {
        match self.state {
            ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
                match self.discovery_deadline_ms {
                    Some(deadline) if current_time_ms >= deadline => {
                        WatchdogVerdict::ForceDisconnect(DisconnectReason::DiscoveryTimeout)
                    }
                    _ => WatchdogVerdict::Healthy,
                }
            }
            ConnectionState::Connected => {
                if !link_up {
                    WatchdogVerdict::ForceDisconnect(DisconnectReason::LinkLost)
                } else if self.time_since_data_ms(current_time_ms) >= self.timeouts.stale_after_ms
                {
                    self.set_state(ConnectionState::Stale, current_time_ms);
                    WatchdogVerdict::ForceDisconnect(DisconnectReason::Stale)
                } else {
                    WatchdogVerdict::Healthy
                }
            }
            // Verdict already issued, waiting for the caller to tear down
            ConnectionState::Stale => WatchdogVerdict::ForceDisconnect(DisconnectReason::Stale),
            _ => WatchdogVerdict::Healthy,
        }
    }

    /// Tear the link down and plan the resume of scanning.
    ///
    /// `resume` carries the device type of a recording the caller just
    /// stopped; it is restarted after the next successful discovery.
    pub fn begin_disconnect(
        &mut self,
        reason: DisconnectReason,
        resume: Option<PendingResume>,
        current_time_ms: u64,
    ) -> ReconnectPlan {
        if resume.is_some() {
            self.pending_resume = resume;
        }
        self.episode += 1;
        self.discovery_deadline_ms = None;
        self.last_teardown = Some(reason);
        let next = if reason.is_forced() {
            ConnectionState::ForcingDisconnect
        } else {
            ConnectionState::Disconnecting
        };
        self.set_state(next, current_time_ms);
        ReconnectPlan {
            episode: self.episode,
            delay_ms: self.timeouts.reconnect_delay_ms,
        }
    }

    /// The radio reports the link closed.
    ///
    /// Returns true if this was unexpected and the caller has to tear down
    /// (stop recording, then [`begin_disconnect`](Self::begin_disconnect)).
    pub fn link_disconnected(&self) -> bool {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Connected
            | ConnectionState::Stale => true,
            // Expected; link state is cleared when the reconnect fires
            ConnectionState::ForcingDisconnect | ConnectionState::Disconnecting => false,
            ConnectionState::PoweredOff | ConnectionState::Scanning => false,
        }
    }

    /// The reconnect delay of `episode` has elapsed. Returns true if scanning
    /// resumed; superseded episodes are ignored.
    ///
    /// Refusing an incompatible device continues the current scan. Any other
    /// teardown starts a new one, which forgets refused devices.
    pub fn reconnect_due(&mut self, episode: u64, current_time_ms: u64) -> bool {
        if episode != self.episode || !self.state.is_tearing_down() {
            return false;
        }
        if self.last_teardown != Some(DisconnectReason::Incompatible) {
            self.ignored.clear();
        }
        self.clear_link();
        self.set_state(ConnectionState::Scanning, current_time_ms);
        true
    }

    fn clear_link(&mut self) {
        self.device = None;
        self.device_type = None;
        self.last_notification_ms = None;
        self.discovery_deadline_ms = None;
        self.connected_at_ms = 0;
    }

    fn set_state(&mut self, new_state: ConnectionState, current_time_ms: u64) {
        if self.state != new_state {
            self.state = new_state;
            self.last_state_change_ms = current_time_ms;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BATTERY_SERVICE, CLASSIC_SERVICE, LITE_SERVICE};

    fn device(id: &str, name: &str) -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId(id.into()),
            name: None,
            advertised_name: Some(name.into()),
            rssi: Some(-70),
        }
    }

    fn connected_at(t0: u64) -> ConnectionManager {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        conn.powered_on(0);
        assert!(conn.candidate_discovered(&device("A", "OBS Lite"), true, "obs", t0));
        conn.link_connected(t0);
        assert!(matches!(
            conn.services_discovered(&[LITE_SERVICE], t0),
            DiscoveryOutcome::Ready {
                device_type: DeviceType::Lite,
                resume: None
            }
        ));
        conn
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        assert_eq!(conn.state(), ConnectionState::PoweredOff);

        conn.powered_on(100);
        assert_eq!(conn.state(), ConnectionState::Scanning);

        // Filter and connectability are checked, first match wins
        assert!(!conn.candidate_discovered(&device("X", "Heart rate"), true, "obs", 150));
        assert!(!conn.candidate_discovered(&device("Y", "OBS"), false, "obs", 160));
        assert!(conn.candidate_discovered(&device("A", "OBS Classic"), true, "obs", 200));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.candidate_discovered(&device("B", "OBS Lite"), true, "obs", 210));
        assert_eq!(conn.device().unwrap().id, DeviceId("A".into()));

        conn.link_connected(300);
        assert_eq!(conn.state(), ConnectionState::DiscoveringServices);

        let outcome = conn.services_discovered(&[BATTERY_SERVICE, CLASSIC_SERVICE], 400);
        assert_eq!(
            outcome,
            DiscoveryOutcome::Ready {
                device_type: DeviceType::Classic,
                resume: None
            }
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.state().allows_recording());
        assert_eq!(conn.time_in_state_ms(900), 500);
    }

    #[test]
    fn test_stale_fires_at_timeout_not_before() {
        let t0 = 10_000;
        let mut conn = connected_at(t0);

        assert_eq!(conn.watchdog_tick(t0 + 1_000, true), WatchdogVerdict::Healthy);
        assert_eq!(conn.watchdog_tick(t0 + 4_999, true), WatchdogVerdict::Healthy);
        assert_eq!(
            conn.watchdog_tick(t0 + 5_000, true),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::Stale)
        );
        assert_eq!(conn.state(), ConnectionState::Stale);
    }

    #[test]
    fn test_notifications_keep_link_alive() {
        let mut conn = connected_at(0);
        conn.notification_received(4_000);
        assert_eq!(conn.watchdog_tick(8_000, true), WatchdogVerdict::Healthy);
        assert_eq!(
            conn.watchdog_tick(9_000, true),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::Stale)
        );
    }

    #[test]
    fn test_link_lost_detected_by_watchdog() {
        let mut conn = connected_at(0);
        assert_eq!(
            conn.watchdog_tick(1_000, false),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::LinkLost)
        );
    }

    #[test]
    fn test_discovery_timeout() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        conn.powered_on(0);
        conn.candidate_discovered(&device("A", "OBS"), true, "obs", 0);
        conn.link_connected(1_000);
        assert_eq!(conn.watchdog_tick(5_999, true), WatchdogVerdict::Healthy);
        assert_eq!(
            conn.watchdog_tick(6_000, true),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::DiscoveryTimeout)
        );
    }

    #[test]
    fn test_forced_disconnect_resumes_recording() {
        let mut conn = connected_at(0);
        conn.watchdog_tick(5_000, true);

        let resume = Some(PendingResume {
            device_type: DeviceType::Lite,
        });
        let plan = conn.begin_disconnect(DisconnectReason::Stale, resume, 5_000);
        assert_eq!(conn.state(), ConnectionState::ForcingDisconnect);
        assert_eq!(plan.delay_ms, 1_000);
        assert_eq!(conn.pending_resume(), resume);

        // The radio confirms the teardown
        assert!(!conn.link_disconnected());

        assert!(conn.reconnect_due(plan.episode, 6_000));
        assert_eq!(conn.state(), ConnectionState::Scanning);
        assert!(conn.device().is_none());
        assert!(conn.device_type().is_none());

        conn.candidate_discovered(&device("A", "OBS"), true, "obs", 6_100);
        conn.link_connected(6_200);
        let outcome = conn.services_discovered(&[LITE_SERVICE], 6_300);
        assert_eq!(
            outcome,
            DiscoveryOutcome::Ready {
                device_type: DeviceType::Lite,
                resume
            }
        );
        // Handed out once
        assert_eq!(conn.pending_resume(), None);
    }

    #[test]
    fn test_superseded_reconnect_is_ignored() {
        let mut conn = connected_at(0);
        let first = conn.begin_disconnect(DisconnectReason::LinkLost, None, 100);
        let second = conn.begin_disconnect(DisconnectReason::User, None, 200);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        assert!(!conn.reconnect_due(first.episode, 1_100));
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        assert!(conn.reconnect_due(second.episode, 1_200));
        // Only once
        assert!(!conn.reconnect_due(second.episode, 1_300));
    }

    #[test]
    fn test_power_off_voids_reconnect() {
        let mut conn = connected_at(0);
        let plan = conn.begin_disconnect(DisconnectReason::LinkLost, None, 100);
        conn.powered_off(200);
        assert!(!conn.reconnect_due(plan.episode, 1_100));
        assert_eq!(conn.state(), ConnectionState::PoweredOff);
    }

    #[test]
    fn test_incompatible_device_is_ignored() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        conn.powered_on(0);
        let heart = device("H", "OBS lookalike");
        assert!(conn.candidate_discovered(&heart, true, "obs", 0));
        conn.link_connected(10);

        let plan = match conn.services_discovered(&[BATTERY_SERVICE], 20) {
            DiscoveryOutcome::Incompatible(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(conn.state(), ConnectionState::ForcingDisconnect);
        assert!(conn.is_ignored(&heart.id));

        // Same scan continues after the refusal
        assert!(conn.reconnect_due(plan.episode, 1_020));
        assert!(!conn.candidate_discovered(&heart, true, "obs", 1_100));
        assert!(conn.candidate_discovered(&device("B", "OBS"), true, "obs", 1_200));

        // B drops; the next scan may try H again
        conn.link_connected(1_300);
        conn.services_discovered(&[LITE_SERVICE], 1_400);
        let plan = conn.begin_disconnect(DisconnectReason::LinkLost, None, 2_000);
        assert!(conn.is_ignored(&heart.id));
        assert!(conn.reconnect_due(plan.episode, 3_000));
        assert!(!conn.is_ignored(&heart.id));
        assert!(conn.candidate_discovered(&heart, true, "obs", 3_100));
    }

    #[test]
    fn test_power_cycle_forgets_refused_devices() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        conn.powered_on(0);
        let heart = device("H", "OBS lookalike");
        conn.candidate_discovered(&heart, true, "obs", 0);
        conn.link_connected(10);
        conn.services_discovered(&[BATTERY_SERVICE], 20);
        assert!(conn.is_ignored(&heart.id));

        conn.powered_off(2_000);
        conn.powered_on(2_100);
        assert!(!conn.is_ignored(&heart.id));
    }

    #[test]
    fn test_connect_without_answer_times_out() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        conn.powered_on(0);
        assert!(conn.candidate_discovered(&device("A", "OBS"), true, "obs", 0));
        assert_eq!(conn.watchdog_tick(4_999, false), WatchdogVerdict::Healthy);
        assert_eq!(
            conn.watchdog_tick(5_000, false),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::DiscoveryTimeout)
        );
        assert_eq!(
            conn.watchdog_tick(600_000, false),
            WatchdogVerdict::ForceDisconnect(DisconnectReason::DiscoveryTimeout)
        );

        let plan = conn.begin_disconnect(DisconnectReason::DiscoveryTimeout, None, 600_000);
        assert!(conn.reconnect_due(plan.episode, 601_000));
        assert_eq!(conn.state(), ConnectionState::Scanning);
    }

    #[test]
    fn test_unexpected_disconnect() {
        let mut conn = connected_at(0);
        assert!(conn.link_disconnected());

        let mut idle = ConnectionManager::new(LinkTimeouts::default());
        idle.powered_on(0);
        assert!(!idle.link_disconnected());
    }

    #[test]
    fn test_discovery_in_wrong_state_ignored() {
        let mut conn = ConnectionManager::new(LinkTimeouts::default());
        assert_eq!(
            conn.services_discovered(&[LITE_SERVICE], 0),
            DiscoveryOutcome::Ignored
        );
    }
}
