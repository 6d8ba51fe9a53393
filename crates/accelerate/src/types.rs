//! Endpoint, event and batch types and their wire serialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Demographic facts about the visitor's device and app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Demographic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Approximate visitor location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Identified user data. Only kept with full statistics consent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_attributes: BTreeMap<String, Vec<String>>,
}

/// The persisted visitor profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub demographic: Demographic,
    #[serde(default)]
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Any other top-level fields (`Address`, `ChannelType`, `OptOut`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Endpoint {
    /// First stored value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Session block attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSession {
    pub id: String,
    pub start_timestamp: String,
    /// Sub-session length in milliseconds, set on `_session.stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timestamp: Option<String>,
}

/// A single analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub event_type: String,
    pub timestamp: String,
    pub app_package_name: String,
    pub app_title: String,
    pub app_version_code: String,
    pub attributes: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub session: EventSession,
}

/// An event together with its UUIDv4 key.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub id: String,
    pub event: Event,
}

/// Endpoint snapshot and events for one identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchItem {
    pub endpoint: Endpoint,
    pub events: BTreeMap<String, Event>,
}

/// `{ BatchItem: { [userId]: { Endpoint, Events } } }`
#[derive(Debug, Clone, Serialize)]
pub struct EventsBatch {
    #[serde(rename = "BatchItem")]
    pub batch_item: BTreeMap<String, BatchItem>,
}

impl EventsBatch {
    pub fn new(user_id: impl Into<String>, item: BatchItem) -> Self {
        Self {
            batch_item: BTreeMap::from([(user_id.into(), item)]),
        }
    }

    /// Total number of events across all identities.
    pub fn event_count(&self) -> usize {
        self.batch_item.values().map(|item| item.events.len()).sum()
    }
}

/// Body posted by the beacon transport.
#[derive(Debug, Clone, Serialize)]
pub struct BeaconPayload<'a> {
    #[serde(rename = "ApplicationId")]
    pub application_id: &'a str,
    #[serde(rename = "Region")]
    pub region: &'a str,
    pub events: &'a EventsBatch,
}

/// Response to a signed `PutEvents` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutEventsResponse {
    #[serde(default)]
    pub results: BTreeMap<String, ItemResponse>,
}

/// Per-identity outcome inside a [`PutEventsResponse`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemResponse {
    #[serde(default)]
    pub endpoint_item_response: Option<StatusResponse>,
    #[serde(default)]
    pub events_item_response: BTreeMap<String, StatusResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event {
            event_type: "pageView".into(),
            timestamp: "2024-01-28T00:00:00.000Z".into(),
            app_package_name: "example".into(),
            app_title: "Example".into(),
            app_version_code: "1.0.0".into(),
            attributes: BTreeMap::from([("url".into(), "https://example.com/".into())]),
            metrics: BTreeMap::from([("elapsed".into(), 0.0)]),
            session: EventSession {
                id: "sub".into(),
                start_timestamp: "2024-01-28T00:00:00.000Z".into(),
                duration: None,
                stop_timestamp: None,
            },
        }
    }

    #[test]
    fn test_event_pascal_case() {
        let json = serde_json::to_value(sample_event()).unwrap();

        assert_eq!(json["EventType"], "pageView");
        assert_eq!(json["AppPackageName"], "example");
        assert_eq!(json["Session"]["Id"], "sub");
        assert!(json["Session"].get("Duration").is_none());
        assert!(json.get("event_type").is_none());
    }

    #[test]
    fn test_endpoint_keeps_unknown_fields() {
        let endpoint: Endpoint = serde_json::from_value(json!({
            "Attributes": {"tag": ["a"]},
            "Metrics": {"sessions": 2},
            "ChannelType": "CUSTOM",
        }))
        .unwrap();

        assert_eq!(endpoint.attribute("tag"), Some("a"));
        assert_eq!(endpoint.metric("sessions"), Some(2.0));
        assert_eq!(endpoint.extra["ChannelType"], "CUSTOM");

        let back = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(back["ChannelType"], "CUSTOM");
        assert!(back.get("User").is_none());
    }

    #[test]
    fn test_batch_structure() {
        let batch = EventsBatch::new(
            "user-1",
            BatchItem {
                endpoint: Endpoint::default(),
                events: BTreeMap::from([("evt-1".into(), sample_event())]),
            },
        );

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            json["BatchItem"]["user-1"]["Events"]["evt-1"]["EventType"],
            "pageView"
        );
        assert!(json["BatchItem"]["user-1"]["Endpoint"].is_object());
        assert_eq!(batch.event_count(), 1);
    }
}
