//! Biometric template records

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::finger::Finger;
use crate::types::DeviceId;

/// Opaque biometric payload.
///
/// The daemon never interprets these bytes; they are produced and
/// consumed by the hardware abstraction. Zeroized on drop.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct TemplateData(pub Vec<u8>);

impl TemplateData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for TemplateData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for TemplateData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// A stored fingerprint reference: one finger of one user on one device
/// identity. Never mutated in place; replacement is delete + recreate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub device_id: DeviceId,
    pub finger: Finger,
    pub username: String,
    pub enroll_date: NaiveDate,
    pub payload: TemplateData,
}

impl Template {
    /// Fresh template handed to the hardware at enrollment start. The
    /// hardware fills in the payload on completion.
    pub fn new_enrollment(
        device_id: DeviceId,
        finger: Finger,
        username: impl Into<String>,
        enroll_date: NaiveDate,
    ) -> Self {
        Self {
            device_id,
            finger,
            username: username.into(),
            enroll_date,
            payload: TemplateData::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Template {
        Template {
            device_id: DeviceId::new("synaptics", "0a2b"),
            finger: Finger::RightIndex,
            username: "alice".into(),
            enroll_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            payload: TemplateData::new(vec![0xde, 0xad, 0xbe, 0xef]),
        }
    }

    #[test]
    fn json_round_trip() {
        let template = sample();
        let json = serde_json::to_string(&template).unwrap();
        let back: Template = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
    }

    #[test]
    fn payload_serializes_as_hex() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("deadbeef"));
    }
}
