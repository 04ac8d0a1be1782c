//! Client for communicating with the dactyl daemon

use std::path::PathBuf;

use tokio::sync::broadcast;

use dactyl_core::Error;
use dactyl_daemon::ipc::{IpcClient, IpcRequest, IpcResponse, SignalBody};

/// Client for the dactyl daemon
pub struct DactylClient {
    inner: IpcClient,
}

/// Error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// An error from the service's own taxonomy
    #[error(transparent)]
    Service(#[from] Error),
}

impl ClientError {
    fn from_daemon_error(e: dactyl_daemon::error::DaemonError) -> Self {
        match &e {
            dactyl_daemon::error::DaemonError::Ipc(msg) if msg.contains("not running") => {
                ClientError::DaemonNotRunning
            }
            _ => ClientError::ConnectionFailed(e.to_string()),
        }
    }

    /// Whether this is the service saying "no prints enrolled".
    pub fn is_no_enrolled_prints(&self) -> bool {
        matches!(self, ClientError::Service(Error::NoEnrolledPrints))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Device properties as exposed over IPC.
#[derive(Debug, Clone)]
pub struct DeviceProps {
    pub name: String,
    pub scan_type: String,
    pub num_enroll_stages: i32,
    pub in_use: bool,
}

impl DactylClient {
    /// Connect using the default socket path
    pub async fn connect() -> Result<Self> {
        Self::connect_to(default_socket_path()).await
    }

    /// Connect to a specific socket path
    pub async fn connect_to(socket_path: PathBuf) -> Result<Self> {
        let inner = IpcClient::connect(&socket_path)
            .await
            .map_err(ClientError::from_daemon_error)?;
        Ok(Self { inner })
    }

    async fn request(&self, request: IpcRequest) -> Result<IpcResponse> {
        let response = self
            .inner
            .request(request)
            .await
            .map_err(ClientError::from_daemon_error)?;
        match response {
            IpcResponse::Error { code, message } => {
                Err(ClientError::Service(Error::from_wire(code, message)))
            }
            other => Ok(other),
        }
    }

    async fn request_ok(&self, request: IpcRequest) -> Result<()> {
        match self.request(request).await? {
            IpcResponse::Ok => Ok(()),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    /// Check if the daemon is running
    pub async fn ping(&self) -> Result<String> {
        match self.request(IpcRequest::Ping).await? {
            IpcResponse::Pong { version } => Ok(version),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    /// Published device paths, most recently added first
    pub async fn get_devices(&self) -> Result<Vec<String>> {
        match self.request(IpcRequest::GetDevices).await? {
            IpcResponse::Devices { paths } => Ok(paths),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    /// The default device path
    pub async fn get_default_device(&self) -> Result<String> {
        match self.request(IpcRequest::GetDefaultDevice).await? {
            IpcResponse::Device { path } => Ok(path),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    pub async fn get_device_info(&self, device: &str) -> Result<DeviceProps> {
        let request = IpcRequest::GetDeviceInfo {
            device: device.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::DeviceInfo {
                name,
                scan_type,
                num_enroll_stages,
                in_use,
            } => Ok(DeviceProps {
                name,
                scan_type,
                num_enroll_stages,
                in_use,
            }),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    pub async fn claim(&self, device: &str, username: &str) -> Result<()> {
        self.request_ok(IpcRequest::Claim {
            device: device.to_string(),
            username: username.to_string(),
        })
        .await
    }

    pub async fn release(&self, device: &str) -> Result<()> {
        self.request_ok(IpcRequest::Release {
            device: device.to_string(),
        })
        .await
    }

    pub async fn verify_start(&self, device: &str, finger: &str) -> Result<()> {
        self.request_ok(IpcRequest::VerifyStart {
            device: device.to_string(),
            finger: finger.to_string(),
        })
        .await
    }

    pub async fn verify_stop(&self, device: &str) -> Result<()> {
        self.request_ok(IpcRequest::VerifyStop {
            device: device.to_string(),
        })
        .await
    }

    pub async fn enroll_start(&self, device: &str, finger: &str) -> Result<()> {
        self.request_ok(IpcRequest::EnrollStart {
            device: device.to_string(),
            finger: finger.to_string(),
        })
        .await
    }

    pub async fn enroll_stop(&self, device: &str) -> Result<()> {
        self.request_ok(IpcRequest::EnrollStop {
            device: device.to_string(),
        })
        .await
    }

    pub async fn list_enrolled_fingers(
        &self,
        device: &str,
        username: &str,
    ) -> Result<Vec<String>> {
        let request = IpcRequest::ListEnrolledFingers {
            device: device.to_string(),
            username: username.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::Fingers { fingers } => Ok(fingers),
            _ => Err(ClientError::RequestFailed("Unexpected response".to_string())),
        }
    }

    pub async fn delete_enrolled_fingers(&self, device: &str, username: &str) -> Result<()> {
        self.request_ok(IpcRequest::DeleteEnrolledFingers {
            device: device.to_string(),
            username: username.to_string(),
        })
        .await
    }

    pub async fn delete_enrolled_fingers2(&self, device: &str) -> Result<()> {
        self.request_ok(IpcRequest::DeleteEnrolledFingers2 {
            device: device.to_string(),
        })
        .await
    }

    /// Subscribe to device signals arriving on this connection
    pub fn signals(&self) -> broadcast::Receiver<(String, SignalBody)> {
        self.inner.signals()
    }
}

/// Platform-appropriate default socket path
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("dactyl.sock"))
        .unwrap_or_else(|| PathBuf::from("/run/dactyl.sock"))
}
