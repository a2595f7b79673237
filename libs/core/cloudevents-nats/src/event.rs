//! CloudEvents v1.0 envelope in structured JSON mode.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spec version written on every event.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of a structured-mode payload.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// A CloudEvent.
///
/// Extensions are string-valued and flatten into the top-level JSON object,
/// as the structured JSON format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "specversion")]
    spec_version: String,
    id: String,
    #[serde(rename = "type")]
    ty: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(rename = "datacontenttype", skip_serializing_if = "Option::is_none")]
    data_content_type: Option<String>,
    #[serde(rename = "dataschema", skip_serializing_if = "Option::is_none")]
    data_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(flatten)]
    extensions: BTreeMap<String, String>,
}

impl Event {
    /// Create a new event with a random id and the current time.
    pub fn new(ty: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            ty: ty.into(),
            source: source.into(),
            subject: None,
            data_content_type: None,
            data_schema: None,
            time: Some(Utc::now()),
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the event subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the data schema.
    pub fn with_data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Set JSON data from any serializable value.
    pub fn with_json_data<T: Serialize>(mut self, data: &T) -> Result<Self, Error> {
        self.data = Some(serde_json::to_value(data)?);
        self.data_content_type = Some("application/json".to_string());
        Ok(self)
    }

    /// Set an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_extension(name, value);
        self
    }

    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Deserialize the event data into a typed value.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| Error::MalformedEvent(format!("event {} carries no data", self.id)))?;
        Ok(serde_json::from_value(data)?)
    }

    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    /// Set or replace an extension attribute.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extensions.insert(name.into(), value.into());
    }

    /// Remove an extension attribute, returning its value.
    pub fn remove_extension(&mut self, name: &str) -> Option<String> {
        self.extensions.remove(name)
    }

    /// Encode in structured JSON mode.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a structured JSON payload and validate required attributes.
    pub fn from_json(payload: &[u8]) -> Result<Self, Error> {
        let event: Event = serde_json::from_slice(payload)
            .map_err(|e| Error::MalformedEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.spec_version != SPEC_VERSION {
            return Err(Error::MalformedEvent(format!(
                "unsupported specversion {:?}",
                self.spec_version
            )));
        }
        for (name, value) in [("id", &self.id), ("type", &self.ty), ("source", &self.source)] {
            if value.is_empty() {
                return Err(Error::MalformedEvent(format!("missing required attribute {name}")));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Event {{ id: {}, type: {}, source: {}",
            self.id, self.ty, self.source
        )?;
        if let Some(subject) = &self.subject {
            write!(f, ", subject: {subject}")?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Example {
        id: u32,
        message: String,
    }

    #[test]
    fn test_structured_json_layout() {
        let event = Event::new("com.example.created", "api")
            .with_id("evt-1")
            .with_extension("tenant", "acme")
            .with_json_data(&Example {
                id: 1,
                message: "Hello World".to_string(),
            })
            .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["type"], "com.example.created");
        assert_eq!(json["datacontenttype"], "application/json");
        // extensions are top-level attributes
        assert_eq!(json["tenant"], "acme");
        assert!(json.get("subject").is_none());
    }

    #[test]
    fn test_decode_typed_data() {
        let event = Event::new("com.example.created", "api")
            .with_json_data(&Example {
                id: 7,
                message: "hi".to_string(),
            })
            .unwrap();

        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        let data: Example = decoded.data_as().unwrap();
        assert_eq!(data.id, 7);
        assert_eq!(decoded.id(), event.id());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Event::from_json(b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        let payload = br#"{"specversion":"1.0","id":"1","type":"","source":"api"}"#;
        let err = Event::from_json(payload).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_decode_rejects_unknown_specversion() {
        let payload = br#"{"specversion":"0.3","id":"1","type":"t","source":"api"}"#;
        assert!(matches!(
            Event::from_json(payload),
            Err(Error::MalformedEvent(_))
        ));
    }
}
