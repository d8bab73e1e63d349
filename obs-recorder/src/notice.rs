//! Operator notices.
//!
//! Only events the rider should know about right away end up here: the link
//! dropped, a recording resumed by itself, an overtake was confirmed or a
//! confirmation was thrown away.

use serde::Serialize;
use tokio::sync::broadcast;

use obs_core::connection::DisconnectReason;
use obs_core::pipeline::OvertakeEvent;
use obs_core::DeviceType;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notice {
    /// Sent once per teardown episode
    #[serde(rename_all = "camelCase")]
    ConnectionLost {
        reason: DisconnectReason,
        episode: u64,
    },
    /// Recording restarted after a reconnect
    #[serde(rename_all = "camelCase")]
    RecordingResumed {
        device_type: DeviceType,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmDiscarded {
        left_cm: Option<u16>,
        right_cm: Option<u16>,
    },
    Overtake(OvertakeEvent),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::ConnectionLost { reason, .. } => {
                write!(f, "Sensor connection lost ({}), reconnecting", reason)
            }
            Notice::RecordingResumed { device_type, path } => {
                write!(f, "Recording resumed for {} sensor: {}", device_type, path)
            }
            Notice::ConfirmDiscarded { left_cm, right_cm } => write!(
                f,
                "Overtake not saved, need readings from both sensors (left {}, right {})",
                fmt_cm(*left_cm),
                fmt_cm(*right_cm)
            ),
            Notice::Overtake(event) => {
                write!(f, "Overtake confirmed at {}", fmt_cm(event.distance_cm))
            }
        }
    }
}

fn fmt_cm(value: Option<u16>) -> String {
    match value {
        Some(cm) => format!("{} cm", cm),
        None => "-".to_string(),
    }
}

/// Fan-out of notices to any number of listeners.
#[derive(Debug, Clone)]
pub struct Notices {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}

impl Notices {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    /// Publish a notice. Nobody listening is fine.
    pub fn publish(&self, notice: Notice) {
        log::debug!("Notice: {}", notice);
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let notices = Notices::new();
        let mut rx = notices.subscribe();
        notices.publish(Notice::ConfirmDiscarded {
            left_cm: Some(55),
            right_cm: None,
        });

        let notice = rx.recv().await.unwrap();
        assert_eq!(
            notice.to_string(),
            "Overtake not saved, need readings from both sensors (left 55 cm, right -)"
        );
    }

    #[test]
    fn test_publish_without_listeners() {
        let notices = Notices::new();
        notices.publish(Notice::ConnectionLost {
            reason: DisconnectReason::Stale,
            episode: 1,
        });
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Notice::ConnectionLost {
            reason: DisconnectReason::LinkLost,
            episode: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "connectionLost");
        assert_eq!(json["reason"], "LinkLost");
        assert_eq!(json["episode"], 3);
    }
}
