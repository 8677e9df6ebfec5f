mod display;
mod status;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use display::{display_label, minutes_since};
pub use status::{Notice, SharingStatus};

/// Latest known position of one participant.
///
/// `observed_at` is milliseconds since the unix epoch, assigned by whoever produced the report.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct ParticipantLocation {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: i64,
}

impl ParticipantLocation {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64, observed_at: i64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            observed_at,
        }
    }
}

/// Changes between two snapshots, each list sorted by participant id.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct SnapshotDiff {
    pub added: Vec<ParticipantLocation>,
    pub updated: Vec<ParticipantLocation>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub enum Topic {
    #[serde(rename = "start")]
    StartSharing,
    #[serde(rename = "stop")]
    StopSharing,
    #[serde(rename = "get-snapshot")]
    GetSnapshot,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "snapshot-diff")]
    SnapshotDiff,
    #[serde(rename = "notice")]
    Notice,
    #[serde(rename = "sharing-status")]
    SharingStatus,
    #[default]
    #[serde(rename = "unknown", other)]
    Unknown,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub enum MessageType {
    #[default]
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "notification")]
    Notification,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
pub struct WsMessage {
    pub id: String,
    pub r#type: MessageType,
    pub topic: Topic,
    pub data: Option<serde_json::Value>,
}

impl WsMessage {
    pub fn command(topic: Topic, data: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            r#type: MessageType::Command,
            topic,
            data,
        }
    }

    /// Server initiated message, not tied to any command
    pub fn notification(topic: Topic, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            r#type: MessageType::Notification,
            topic,
            data: Some(data),
        }
    }

    pub fn response_with_data(&self, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            r#type: MessageType::Response,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).map_err(anyhow::Error::msg)
    }

    pub fn from_json(str: &str) -> anyhow::Result<Self> {
        serde_json::from_str(str).map_err(anyhow::Error::msg)
    }
}
