use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One row of the locations table. Coordinates travel as two numeric columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRow {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_updated: DateTime<Utc>,
}

impl LocationRow {
    /// Returns `None` if `observed_at` (ms since epoch) is outside the representable range
    pub fn from_observation(
        user_id: &str,
        latitude: f64,
        longitude: f64,
        observed_at: i64,
    ) -> Option<Self> {
        Some(Self {
            user_id: user_id.to_string(),
            latitude,
            longitude,
            last_updated: DateTime::from_timestamp_millis(observed_at)?,
        })
    }

    pub fn observed_at(&self) -> i64 {
        self.last_updated.timestamp_millis()
    }
}

/// A change to the locations table as seen by this client
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upsert(LocationRow),
    Delete { user_id: String },
    Malformed(String),
}

impl ChangeEvent {
    pub fn from_record(record: serde_json::Value) -> Self {
        match serde_json::from_value::<LocationRow>(record) {
            Ok(row) => ChangeEvent::Upsert(row),
            Err(e) => ChangeEvent::Malformed(format!("cannot decode location row: {e}")),
        }
    }

    pub fn from_old_record(old_record: &serde_json::Value) -> Self {
        match old_record.get("user_id").and_then(|v| v.as_str()) {
            Some(user_id) if !user_id.is_empty() => ChangeEvent::Delete {
                user_id: user_id.to_string(),
            },
            _ => ChangeEvent::Malformed("delete event without `user_id`".to_string()),
        }
    }
}

// Accept both RFC 3339 and the postgres text form (`2024-03-01 10:00:00.123+00`)
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
        return Ok(ts.with_timezone(&Utc));
    }
    DateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp `{s}`: {e}")))
}
