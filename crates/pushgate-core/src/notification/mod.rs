//! Push-notification model.
//!
//! A [`Notification`] is the application-level view of one push: a device
//! token, a JSON payload built around the `aps` dictionary, a four-byte
//! identifier, and optional expiration and priority hints. Producers submit
//! it in the JSON shape the ingress accepts (`deviceToken`, `payload` with
//! `aps` + `customValues`, `identifier`, `expires`, `priority`); on the wire
//! the payload is re-shaped so custom fields sit beside `aps` at the top
//! level.
//!
//! Field validation (token length, payload size, reserved names) happens at
//! encode time in [`crate::wire`], not at construction, so a notification can
//! be built and inspected freely before submission.

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `alert` dictionary of the `aps` block.
///
/// All fields are optional and omitted from JSON when unset; key names are
/// the kebab-case forms Apple documents (`title-loc-key`, `loc-args`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Alert {
    /// Short title shown by the OS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Localization key for the title.
    #[serde(
        rename = "title-loc-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub title_loc_key: Option<String>,
    /// Ordered arguments substituted into the localized title.
    #[serde(
        rename = "title-loc-args",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub title_loc_args: Vec<String>,
    /// Localization key for the action button.
    #[serde(
        rename = "action-loc-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub action_loc_key: Option<String>,
    /// Localization key for the body.
    #[serde(rename = "loc-key", default, skip_serializing_if = "Option::is_none")]
    pub loc_key: Option<String>,
    /// Ordered arguments substituted into the localized body.
    #[serde(rename = "loc-args", default, skip_serializing_if = "Vec::is_empty")]
    pub loc_args: Vec<String>,
    /// Launch image file name.
    #[serde(
        rename = "launch-image",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub launch_image: Option<String>,
}

/// The `alert` value: either a bare string or the full dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlertValue {
    /// Plain alert text.
    Text(String),
    /// Structured alert dictionary.
    Dictionary(Alert),
}

impl From<&str> for AlertValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// The `aps` dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aps {
    /// Alert string or dictionary. Required by the time a notification is
    /// encoded for the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertValue>,
    /// Badge count; non-negative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    /// Sound file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// Content-available flag for silent pushes.
    #[serde(
        rename = "content-available",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_available: Option<i32>,
    /// Notification category identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// The notification payload: the `aps` block plus arbitrary custom fields.
///
/// Producers supply custom fields under `customValues`; the wire payload
/// flattens them next to `aps` at the top level. `aps` is a reserved name
/// and the encoder rejects a custom field that would shadow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// The `aps` dictionary; required at encode time.
    pub aps: Option<Aps>,
    custom: Map<String, Value>,
}

impl Payload {
    /// Creates an empty payload with a blank `aps` dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aps: Some(Aps::default()),
            custom: Map::new(),
        }
    }

    /// Adds a custom top-level field.
    ///
    /// The name `aps` is reserved; the conflict is reported when the
    /// notification is encoded, not here.
    pub fn add_custom_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.custom.insert(key.into(), value.into());
    }

    /// Returns the custom top-level fields.
    #[must_use]
    pub fn custom_fields(&self) -> &Map<String, Value> {
        &self.custom
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.custom.len() + 1))?;
        for (key, value) in &self.custom {
            // The encoder rejects a shadowing custom field; for display
            // purposes `aps` always wins.
            if key == "aps" {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        if let Some(aps) = &self.aps {
            map.serialize_entry("aps", aps)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct PayloadWire {
            #[serde(default)]
            aps: Option<Aps>,
            #[serde(default, rename = "customValues")]
            custom_values: Map<String, Value>,
        }

        let wire = PayloadWire::deserialize(deserializer)?;
        Ok(Self {
            aps: wire.aps,
            custom: wire.custom_values,
        })
    }
}

/// One push notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Target device token: 64 hex characters decoding to 32 bytes.
    #[serde(rename = "deviceToken")]
    pub device_token: String,
    /// Payload delivered to the device.
    pub payload: Payload,
    /// Four random bytes as 8 hex characters; echoed back by the gateway in
    /// error responses. Generated at construction, overridable by producers.
    pub identifier: String,
    /// Absolute time after which the gateway discards the notification.
    #[serde(rename = "expires", skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,
    /// Delivery priority: 5 or 10, or 0 when unspecified.
    #[serde(skip_serializing_if = "priority_is_unspecified")]
    pub priority: u8,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // signature dictated by serde
fn priority_is_unspecified(priority: &u8) -> bool {
    *priority == 0
}

impl Notification {
    /// Creates a blank notification with a freshly generated identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            device_token: String::new(),
            payload: Payload::new(),
            identifier: generate_identifier(),
            expiration_date: None,
            priority: 0,
        }
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl<'de> Deserialize<'de> for Notification {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct NotificationWire {
            #[serde(rename = "deviceToken")]
            device_token: String,
            payload: Payload,
            #[serde(default)]
            identifier: Option<String>,
            #[serde(default)]
            expires: Option<DateTime<Utc>>,
            #[serde(default)]
            priority: u8,
        }

        let wire = NotificationWire::deserialize(deserializer)?;
        if !matches!(wire.priority, 0 | 5 | 10) {
            return Err(serde::de::Error::custom("priority must be 5 or 10"));
        }
        Ok(Self {
            device_token: wire.device_token,
            payload: wire.payload,
            // A producer-supplied identifier wins; otherwise keep a
            // generated one so the gateway can still name the offender in
            // an error response.
            identifier: wire.identifier.unwrap_or_else(generate_identifier),
            expiration_date: wire.expires,
            priority: wire.priority,
        })
    }
}

/// Generates a notification identifier: 4 random bytes as 8 hex characters.
fn generate_identifier() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}
