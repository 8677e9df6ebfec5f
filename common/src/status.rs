use serde::Deserialize;
use serde::Serialize;

use crate::ParticipantLocation;

/// Conditions surfaced to the user. None of them are fatal to the session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", content = "reason", rename_all = "kebab-case")]
pub enum Notice {
    SharingStarted,
    SharingStopped,
    CapabilityUnavailable(String),
    LocationUnavailable(String),
    PublishFailed(String),
}

impl Notice {
    pub fn is_error(&self) -> bool {
        !matches!(self, Notice::SharingStarted | Notice::SharingStopped)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notice::SharingStarted => "Location Sharing",
            Notice::SharingStopped => "Location Sharing Stopped",
            Notice::CapabilityUnavailable(_) => "Error",
            Notice::LocationUnavailable(_) => "Location Error",
            Notice::PublishFailed(_) => "Error",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Notice::SharingStarted => "You are now sharing your location".into(),
            Notice::SharingStopped => "You have stopped sharing your location".into(),
            Notice::CapabilityUnavailable(reason) => {
                format!("Geolocation is not available: {reason}")
            }
            Notice::LocationUnavailable(reason) => reason.clone(),
            Notice::PublishFailed(reason) => format!("Failed to update location: {reason}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct SharingStatus {
    pub participant_id: String,
    pub is_sharing: bool,
    pub participants: usize,
    pub own_location: Option<ParticipantLocation>,
}
