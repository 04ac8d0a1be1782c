//! IPC client implementation
//!
//! A connected client multiplexes one socket: requests are tagged with
//! ids and matched to replies, while unsolicited device signals fan out
//! to subscribers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{DaemonError, Result};

use super::connection::{IpcClientTransport, PlatformClient};
use super::types::{ClientEnvelope, IpcRequest, IpcResponse, ServerEnvelope, SignalBody};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<IpcResponse>>>>;

/// Connected IPC client.
pub struct IpcClient {
    next_id: AtomicU64,
    pending: PendingMap,
    out_tx: mpsc::Sender<ClientEnvelope>,
    signal_tx: broadcast::Sender<(String, SignalBody)>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl IpcClient {
    /// Connect to the daemon socket.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = PlatformClient::connect(socket_path).await?;
        let (reader, mut writer) = tokio::io::split(stream);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (signal_tx, _) = broadcast::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEnvelope>(64);

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

        let reader_task = {
            let pending = Arc::clone(&pending);
            let signal_tx = signal_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let envelope: ServerEnvelope = match serde_json::from_str(&line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            debug!("dropping unparseable server line: {}", e);
                            continue;
                        }
                    };
                    match envelope {
                        ServerEnvelope::Reply { id, response } => {
                            let sender = pending.lock().expect("pending map poisoned").remove(&id);
                            if let Some(sender) = sender {
                                let _ = sender.send(response);
                            }
                        }
                        ServerEnvelope::Signal { device, signal } => {
                            let _ = signal_tx.send((device, signal));
                        }
                    }
                }
                // Wake every caller still waiting for a reply
                pending.lock().expect("pending map poisoned").clear();
            })
        };

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            out_tx,
            signal_tx,
            reader_task,
            writer_task,
        })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, request: IpcRequest) -> Result<IpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        self.out_tx
            .send(ClientEnvelope { id, request })
            .await
            .map_err(|_| DaemonError::Ipc("Connection closed".to_string()))?;

        rx.await
            .map_err(|_| DaemonError::Ipc("Connection closed".to_string()))
    }

    /// Subscribe to device signals received on this connection.
    pub fn signals(&self) -> broadcast::Receiver<(String, SignalBody)> {
        self.signal_tx.subscribe()
    }

    /// Check if the daemon is answering
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(IpcRequest::Ping).await,
            Ok(IpcResponse::Pong { .. })
        )
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
