//! Core identity and capability types

use serde::{Deserialize, Serialize};

/// Stable identity of one physical scanner: driver name plus the
/// hardware instance identifier the driver reports. Assigned at
/// discovery and never changes for the lifetime of the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub driver: String,
    pub instance: String,
}

impl DeviceId {
    pub fn new(driver: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            instance: instance.into(),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.driver, self.instance)
    }
}

/// How the sensor reads a finger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Press,
    Swipe,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Press => "press",
            ScanType::Swipe => "swipe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "press" => Some(ScanType::Press),
            "swipe" => Some(ScanType::Swipe),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_type_round_trip() {
        assert_eq!(ScanType::parse("press"), Some(ScanType::Press));
        assert_eq!(ScanType::parse("swipe"), Some(ScanType::Swipe));
        assert_eq!(ScanType::parse("optical"), None);
        assert_eq!(ScanType::Swipe.as_str(), "swipe");
    }

    #[test]
    fn device_id_display() {
        let id = DeviceId::new("synaptics", "0a2b");
        assert_eq!(id.to_string(), "synaptics/0a2b");
    }
}
