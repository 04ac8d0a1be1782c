//! IPC server implementation
//!
//! One task per connection. Replies go back tagged with the request id;
//! device signals are forwarded to every connection that has touched
//! the device. When a connection closes, every controller it touched is
//! told the client vanished — that is the liveness watch backing claim
//! cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use dactyl_core::Error;

use crate::access::{ConnId, PeerInfo, UserDb};
use crate::device::DeviceHandle;
use crate::error::Result;
use crate::registry::RegistryHandle;

use super::connection::{IpcTransport, PlatformTransport};
use super::types::{ClientEnvelope, IpcRequest, IpcResponse, ServerEnvelope};

/// IPC server
pub struct IpcServer {
    /// Socket path
    socket_path: PathBuf,

    /// Device registry
    registry: RegistryHandle,

    /// uid to username resolution for peer identities
    user_db: Arc<dyn UserDb>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: PathBuf, registry: RegistryHandle, user_db: Arc<dyn UserDb>) -> Self {
        Self {
            socket_path,
            registry,
            user_db,
        }
    }

    /// Start the IPC server
    pub async fn run(&self) -> Result<()> {
        let transport = PlatformTransport::bind(&self.socket_path).await?;

        info!("IPC server listening on {:?}", self.socket_path);

        let mut next_conn: ConnId = 0;
        loop {
            match transport.accept().await {
                Ok((stream, creds)) => {
                    next_conn += 1;
                    let peer = PeerInfo {
                        conn: next_conn,
                        uid: creds.uid,
                        pid: creds.pid,
                        username: self.user_db.name_for_uid(creds.uid),
                    };
                    let registry = self.registry.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, registry).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single IPC connection
async fn handle_connection<S>(stream: S, peer: PeerInfo, registry: RegistryHandle) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // All writes go through one task so replies and signals interleave
    // cleanly on the wire.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEnvelope>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut touched: HashMap<String, DeviceHandle> = HashMap::new();
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    let mut line = String::new();

    let io_result = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }

        let envelope: ClientEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                let response = IpcResponse::error(Error::Internal(format!("Invalid request: {e}")));
                let _ = out_tx
                    .send(ServerEnvelope::Reply { id: 0, response })
                    .await;
                continue;
            }
        };

        debug!("conn {} request: {:?}", peer.conn, envelope.request);

        let response = handle_request(
            envelope.request,
            &peer,
            &registry,
            &mut touched,
            &mut forwarders,
            &out_tx,
        )
        .await;

        let _ = out_tx
            .send(ServerEnvelope::Reply {
                id: envelope.id,
                response,
            })
            .await;
    };

    // Fire the liveness watches before tearing the connection down
    for handle in touched.values() {
        handle.client_vanished(peer.conn).await;
    }
    for forwarder in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;

    io_result
}

/// Look up a device and start forwarding its signals to this
/// connection on first touch.
async fn touch_device(
    registry: &RegistryHandle,
    touched: &mut HashMap<String, DeviceHandle>,
    forwarders: &mut Vec<JoinHandle<()>>,
    out_tx: &mpsc::Sender<ServerEnvelope>,
    path: &str,
) -> std::result::Result<DeviceHandle, Error> {
    if let Some(handle) = touched.get(path) {
        return Ok(handle.clone());
    }

    let handle = registry.find(path).await?;

    let mut events = handle.subscribe();
    let out = out_tx.clone();
    let device = handle.path.clone();
    forwarders.push(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(signal) => {
                    let envelope = ServerEnvelope::Signal {
                        device: device.clone(),
                        signal: signal.into(),
                    };
                    if out.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }));

    touched.insert(path.to_string(), handle.clone());
    Ok(handle)
}

/// Handle a single request
async fn handle_request(
    request: IpcRequest,
    peer: &PeerInfo,
    registry: &RegistryHandle,
    touched: &mut HashMap<String, DeviceHandle>,
    forwarders: &mut Vec<JoinHandle<()>>,
    out_tx: &mpsc::Sender<ServerEnvelope>,
) -> IpcResponse {
    macro_rules! device {
        ($path:expr) => {
            match touch_device(registry, touched, forwarders, out_tx, &$path).await {
                Ok(handle) => handle,
                Err(e) => return IpcResponse::error(e),
            }
        };
    }

    fn unit(result: std::result::Result<(), Error>) -> IpcResponse {
        match result {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::error(e),
        }
    }

    match request {
        IpcRequest::Ping => IpcResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        IpcRequest::GetDevices => match registry.get_devices().await {
            Ok(devices) => IpcResponse::Devices {
                paths: devices.into_iter().map(|d| d.path).collect(),
            },
            Err(e) => IpcResponse::error(e),
        },

        IpcRequest::GetDefaultDevice => match registry.get_default_device().await {
            Ok(device) => IpcResponse::Device { path: device.path },
            Err(e) => IpcResponse::error(e),
        },

        IpcRequest::GetDeviceInfo { device } => {
            let handle = device!(device);
            match handle.info().await {
                Ok(info) => info.into(),
                Err(e) => IpcResponse::error(e),
            }
        }

        IpcRequest::Claim { device, username } => {
            let handle = device!(device);
            unit(handle.claim(peer.clone(), username).await)
        }

        IpcRequest::Release { device } => {
            let handle = device!(device);
            unit(handle.release(peer.clone()).await)
        }

        IpcRequest::VerifyStart { device, finger } => {
            let handle = device!(device);
            unit(handle.verify_start(peer.clone(), finger).await)
        }

        IpcRequest::VerifyStop { device } => {
            let handle = device!(device);
            unit(handle.verify_stop(peer.clone()).await)
        }

        IpcRequest::EnrollStart { device, finger } => {
            let handle = device!(device);
            unit(handle.enroll_start(peer.clone(), finger).await)
        }

        IpcRequest::EnrollStop { device } => {
            let handle = device!(device);
            unit(handle.enroll_stop(peer.clone()).await)
        }

        IpcRequest::ListEnrolledFingers { device, username } => {
            let handle = device!(device);
            match handle.list_enrolled_fingers(peer.clone(), username).await {
                Ok(fingers) => IpcResponse::Fingers { fingers },
                Err(e) => IpcResponse::error(e),
            }
        }

        IpcRequest::DeleteEnrolledFingers { device, username } => {
            let handle = device!(device);
            unit(handle.delete_enrolled_fingers(peer.clone(), username).await)
        }

        IpcRequest::DeleteEnrolledFingers2 { device } => {
            let handle = device!(device);
            unit(handle.delete_enrolled_fingers2(peer.clone()).await)
        }
    }
}
