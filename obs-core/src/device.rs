//! Sensor device definitions
//!
//! Two hardware generations exist and they share nothing on the wire. The
//! generation is decided once per connection from the advertised services.

use serde::{Deserialize, Serialize, Serializer};

// =============================================================================
// Service and characteristic identifiers
// =============================================================================

/// Lite: Nordic UART service carrying protobuf events
pub const LITE_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Lite: notify characteristic (device to host)
pub const LITE_TX_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Classic: sensor service
pub const CLASSIC_SERVICE: &str = "1fe7faf9-ce63-4236-0004-000000000000";
/// Classic: continuous distance packets (notify)
pub const CLASSIC_DISTANCE_CHARACTERISTIC: &str = "1fe7faf9-ce63-4236-0004-000000000001";
/// Classic: confirm button (notify)
pub const CLASSIC_BUTTON_CHARACTERISTIC: &str = "1fe7faf9-ce63-4236-0004-000000000002";
/// Classic: handlebar offsets (read)
pub const CLASSIC_OFFSET_CHARACTERISTIC: &str = "1fe7faf9-ce63-4236-0004-000000000003";
/// Classic: device id text (read)
pub const CLASSIC_ID_CHARACTERISTIC: &str = "1fe7faf9-ce63-4236-0004-000000000004";

/// Standard battery service and level characteristic
pub const BATTERY_SERVICE: &str = "0000180f-0000-1000-8000-00805f9b34fb";
pub const BATTERY_LEVEL_CHARACTERISTIC: &str = "00002a19-0000-1000-8000-00805f9b34fb";
/// Standard device information service and firmware revision characteristic
pub const DEVICE_INFO_SERVICE: &str = "0000180a-0000-1000-8000-00805f9b34fb";
pub const FIRMWARE_REVISION_CHARACTERISTIC: &str = "00002a26-0000-1000-8000-00805f9b34fb";

// =============================================================================
// Device type
// =============================================================================

/// Sensor generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum DeviceType {
    /// Protobuf events, COBS framed
    Lite,
    /// Fixed 8-byte distance packets plus a button characteristic
    Classic,
}

impl DeviceType {
    /// Get the device type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Lite => "Lite",
            DeviceType::Classic => "Classic",
        }
    }

    /// Service that identifies this generation
    pub fn service(&self) -> &'static str {
        match self {
            DeviceType::Lite => LITE_SERVICE,
            DeviceType::Classic => CLASSIC_SERVICE,
        }
    }

    /// Characteristics to subscribe to once connected
    pub fn notify_characteristics(&self) -> &'static [&'static str] {
        match self {
            DeviceType::Lite => &[LITE_TX_CHARACTERISTIC],
            DeviceType::Classic => &[
                CLASSIC_DISTANCE_CHARACTERISTIC,
                CLASSIC_BUTTON_CHARACTERISTIC,
            ],
        }
    }

    /// Classify a device from the services it advertises.
    ///
    /// Lite wins if, for some reason, both services are present.
    pub fn classify<S: AsRef<str>>(services: &[S]) -> Option<DeviceType> {
        let has = |wanted: &str| services.iter().any(|s| uuid_eq(s.as_ref(), wanted));
        if has(LITE_SERVICE) {
            Some(DeviceType::Lite)
        } else if has(CLASSIC_SERVICE) {
            Some(DeviceType::Classic)
        } else {
            None
        }
    }

    /// File extension used for recordings of this generation
    pub fn file_extension(&self) -> &'static str {
        match self {
            DeviceType::Lite => "bin",
            DeviceType::Classic => "csv",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for DeviceType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<&str> for DeviceType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "lite" => Ok(DeviceType::Lite),
            "classic" => Ok(DeviceType::Classic),
            _ => Err(format!("Unknown device type: {}", s)),
        }
    }
}

/// Compare two UUID strings ignoring case
pub fn uuid_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

// =============================================================================
// Device identity
// =============================================================================

/// Opaque handle the radio layer uses for a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral as seen during a scan. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub id: DeviceId,
    /// Name reported by the platform (may be cached from an earlier connection)
    pub name: Option<String>,
    /// Local name from the advertisement packet
    pub advertised_name: Option<String>,
    /// Signal strength sample in dBm
    pub rssi: Option<i16>,
}

impl DeviceIdentity {
    /// Name to show the operator
    pub fn display_name(&self) -> &str {
        self.advertised_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.id.0)
    }

    /// Case-insensitive substring match of either name against `filter`.
    ///
    /// An empty filter matches every device that has a name.
    pub fn matches(&self, filter: &str) -> bool {
        let filter = filter.to_lowercase();
        [self.advertised_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .any(|name| name.to_lowercase().contains(&filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: Option<&str>, advertised: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId("AA:BB".into()),
            name: name.map(String::from),
            advertised_name: advertised.map(String::from),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            DeviceType::classify(&["6E400001-B5A3-F393-E0A9-E50E24DCCA9E"]),
            Some(DeviceType::Lite)
        );
        assert_eq!(
            DeviceType::classify(&[BATTERY_SERVICE, CLASSIC_SERVICE]),
            Some(DeviceType::Classic)
        );
        assert_eq!(DeviceType::classify(&[BATTERY_SERVICE]), None);
        assert_eq!(DeviceType::classify::<&str>(&[]), None);
    }

    #[test]
    fn test_name_filter() {
        assert!(identity(None, Some("OBS Lite LiDAR")).matches("obs"));
        assert!(identity(Some("openbikesensor OBS-1234"), None).matches("OBS"));
        assert!(!identity(Some("Heart rate"), Some("HRM")).matches("obs"));
        assert!(!identity(None, None).matches("obs"));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(identity(Some("a"), Some("b")).display_name(), "b");
        assert_eq!(identity(Some("a"), None).display_name(), "a");
        assert_eq!(identity(None, None).display_name(), "AA:BB");
    }

    #[test]
    fn test_device_type_parse() {
        assert_eq!(DeviceType::try_from("LITE"), Ok(DeviceType::Lite));
        assert_eq!(DeviceType::try_from("classic"), Ok(DeviceType::Classic));
        assert!(DeviceType::try_from("furuno").is_err());
        assert_eq!(
            serde_json::to_string(&DeviceType::Classic).unwrap(),
            "\"Classic\""
        );
    }
}
