//! IPC protocol types
//!
//! Message types for daemon-client communication. Requests that target
//! a device carry the device's published path.

use serde::{Deserialize, Serialize};

use dactyl_core::{Error, ErrorCode};

use crate::device::{DeviceInfo, DeviceSignal};

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Check if the daemon is running
    Ping,

    /// List published device paths, most recently added first
    GetDevices,

    /// Get the default (least recently added) device path
    GetDefaultDevice,

    /// Get display properties of a device
    GetDeviceInfo { device: String },

    /// Take the exclusive claim on a device
    Claim { device: String, username: String },

    /// Give up the claim
    Release { device: String },

    /// Start a verification; results arrive as VerifyStatus signals
    VerifyStart { device: String, finger: String },

    /// Stop the running verification
    VerifyStop { device: String },

    /// Start an enrollment; results arrive as EnrollStatus signals
    EnrollStart { device: String, finger: String },

    /// Stop the running enrollment
    EnrollStop { device: String },

    /// List enrolled finger names for a user
    ListEnrolledFingers { device: String, username: String },

    /// Delete a user's enrolled fingers (deprecated variant)
    DeleteEnrolledFingers { device: String, username: String },

    /// Delete the claiming session's own enrolled fingers
    DeleteEnrolledFingers2 { device: String },
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcResponse {
    /// Success with no data
    Ok,

    /// Pong response
    Pong { version: String },

    /// Error response with a stable code
    Error { code: ErrorCode, message: String },

    /// Published device paths
    Devices { paths: Vec<String> },

    /// A single device path
    Device { path: String },

    /// Enrolled finger names
    Fingers { fingers: Vec<String> },

    /// Device properties
    DeviceInfo {
        name: String,
        scan_type: String,
        num_enroll_stages: i32,
        in_use: bool,
    },
}

impl IpcResponse {
    pub fn error(e: Error) -> Self {
        IpcResponse::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<DeviceInfo> for IpcResponse {
    fn from(info: DeviceInfo) -> Self {
        IpcResponse::DeviceInfo {
            name: info.name,
            scan_type: info.scan_type.as_str().to_string(),
            num_enroll_stages: info.num_enroll_stages,
            in_use: info.in_use,
        }
    }
}

/// Device signals pushed to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal")]
pub enum SignalBody {
    VerifyStatus { result: String, done: bool },
    VerifyFingerSelected { finger: String },
    EnrollStatus { result: String, done: bool },
}

impl From<DeviceSignal> for SignalBody {
    fn from(signal: DeviceSignal) -> Self {
        match signal {
            DeviceSignal::VerifyStatus { result, done } => SignalBody::VerifyStatus { result, done },
            DeviceSignal::VerifyFingerSelected { finger } => {
                SignalBody::VerifyFingerSelected { finger }
            }
            DeviceSignal::EnrollStatus { result, done } => SignalBody::EnrollStatus { result, done },
        }
    }
}

/// One client-to-server line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub id: u64,
    pub request: IpcRequest,
}

/// One server-to-client line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerEnvelope {
    Reply { id: u64, response: IpcResponse },
    Signal { device: String, signal: SignalBody },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_round_trip() {
        let envelope = ClientEnvelope {
            id: 7,
            request: IpcRequest::VerifyStart {
                device: "/dactyl/device/0".into(),
                finger: "any".into(),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: ClientEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert!(matches!(back.request, IpcRequest::VerifyStart { .. }));

        let signal = ServerEnvelope::Signal {
            device: "/dactyl/device/0".into(),
            signal: SignalBody::VerifyStatus {
                result: "verify-match".into(),
                done: true,
            },
        };
        let json = serde_json::to_string(&signal).unwrap();
        let back: ServerEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ServerEnvelope::Signal { .. }));
    }

    #[test]
    fn errors_cross_the_wire() {
        let response = IpcResponse::error(Error::NoEnrolledPrints);
        let json = serde_json::to_string(&response).unwrap();
        let IpcResponse::Error { code, message } = serde_json::from_str(&json).unwrap() else {
            panic!("expected an error response");
        };
        assert_eq!(code, ErrorCode::NoEnrolledPrints);
        let back = Error::from_wire(code, message);
        assert!(matches!(back, Error::NoEnrolledPrints));
    }
}
