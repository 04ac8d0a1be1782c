//! Device registry: discovery, hotplug and the idle timeout
//!
//! The registry task owns the device-identity to controller mapping.
//! It is mutated only by hotplug events from the hardware abstraction;
//! readers get a stable snapshot. It also watches every controller's
//! in-use flag and runs the countdown that terminates the daemon once
//! nothing has been in use for the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dactyl_core::{Error, Result};

use crate::access::Authority;
use crate::device::{spawn_controller, DeviceHandle, InUseChanged};
use crate::hardware::HotplugEvent;
use crate::store::TemplateStore;

/// Per-registry device number allocator.
struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

enum RegistryCommand {
    GetDevices {
        reply: oneshot::Sender<Vec<DeviceHandle>>,
    },
    GetDefaultDevice {
        reply: oneshot::Sender<Result<DeviceHandle>>,
    },
    Find {
        path: String,
        reply: oneshot::Sender<Option<DeviceHandle>>,
    },
}

/// Cloneable façade over the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Snapshot of published devices, most-recently-added first.
    pub async fn get_devices(&self) -> Result<Vec<DeviceHandle>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RegistryCommand::GetDevices { reply: tx })
            .await
            .map_err(|_| Error::Internal("registry is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("registry is gone".into()))
    }

    /// The least-recently-added device, or NoSuchDevice when empty.
    pub async fn get_default_device(&self) -> Result<DeviceHandle> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RegistryCommand::GetDefaultDevice { reply: tx })
            .await
            .map_err(|_| Error::Internal("registry is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("registry is gone".into()))?
    }

    /// Resolve a published device path to its controller.
    pub async fn find(&self, path: &str) -> Result<DeviceHandle> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RegistryCommand::Find {
                path: path.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Internal("registry is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("registry is gone".into()))?
            .ok_or(Error::NoSuchDevice)
    }
}

/// Spawn the registry task.
///
/// `idle_timeout` of `None` disables the countdown. When the countdown
/// expires a unit is sent on `idle_tx`; the hosting process is expected
/// to exit cleanly in response.
pub fn spawn_registry(
    store: Arc<TemplateStore>,
    authority: Arc<dyn Authority>,
    hotplug_rx: mpsc::Receiver<HotplugEvent>,
    idle_timeout: Option<Duration>,
    idle_tx: mpsc::Sender<()>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let registry = Registry {
        store,
        authority,
        alloc: IdAllocator::new(),
        devices: Vec::new(),
        in_use: HashMap::new(),
        notice_tx,
        idle_timeout,
        idle_tx,
    };

    tokio::spawn(registry.run(cmd_rx, hotplug_rx, notice_rx));

    RegistryHandle { cmd_tx }
}

struct Registry {
    store: Arc<TemplateStore>,
    authority: Arc<dyn Authority>,
    alloc: IdAllocator,
    /// Registration order: index 0 is the least recently added
    devices: Vec<DeviceHandle>,
    in_use: HashMap<u32, bool>,
    notice_tx: mpsc::UnboundedSender<InUseChanged>,
    idle_timeout: Option<Duration>,
    idle_tx: mpsc::Sender<()>,
}

impl Registry {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RegistryCommand>,
        mut hotplug_rx: mpsc::Receiver<HotplugEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<InUseChanged>,
    ) {
        // The countdown starts armed: a daemon nobody uses should not
        // linger.
        let mut deadline = self.arm_deadline();

        loop {
            let idle_expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = hotplug_rx.recv() => match event {
                    Some(event) => {
                        self.handle_hotplug(event).await;
                        deadline = self.recompute_deadline();
                    }
                    // Hotplug source gone; keep serving what we have
                    None => {}
                },
                notice = notice_rx.recv() => {
                    if let Some(notice) = notice {
                        self.in_use.insert(notice.id, notice.in_use);
                        deadline = self.recompute_deadline();
                    }
                }
                _ = idle_expiry => {
                    info!("idle timeout expired, asking the daemon to exit");
                    let _ = self.idle_tx.send(()).await;
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::GetDevices { reply } => {
                // Most recently added first
                let snapshot: Vec<_> = self.devices.iter().rev().cloned().collect();
                let _ = reply.send(snapshot);
            }
            RegistryCommand::GetDefaultDevice { reply } => {
                let result = self
                    .devices
                    .first()
                    .cloned()
                    .ok_or(Error::NoSuchDevice);
                let _ = reply.send(result);
            }
            RegistryCommand::Find { path, reply } => {
                let found = self.devices.iter().find(|d| d.path == path).cloned();
                let _ = reply.send(found);
            }
        }
    }

    async fn handle_hotplug(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Added(scanner) => {
                let id = self.alloc.next_id();
                let device_id = scanner.device_id().clone();
                let handle = spawn_controller(
                    id,
                    scanner,
                    Arc::clone(&self.store),
                    Arc::clone(&self.authority),
                    self.notice_tx.clone(),
                );
                info!("device {} added at {}", device_id, handle.path);
                self.in_use.insert(id, false);
                self.devices.push(handle);
            }
            HotplugEvent::Removed(device_id) => {
                let Some(pos) = self
                    .devices
                    .iter()
                    .position(|d| d.device_id == device_id)
                else {
                    warn!("removal event for unknown device {}", device_id);
                    return;
                };
                let handle = self.devices.remove(pos);
                info!("device {} removed from {}", device_id, handle.path);
                self.in_use.remove(&handle.id);
                handle.shutdown().await;
            }
        }
    }

    fn recompute_deadline(&self) -> Option<Instant> {
        let any_in_use = self.in_use.values().any(|v| *v);
        if any_in_use {
            None
        } else {
            self.arm_deadline()
        }
    }

    fn arm_deadline(&self) -> Option<Instant> {
        let timeout = self.idle_timeout?;
        debug!("arming idle countdown of {:?}", timeout);
        Some(Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Permissive;
    use crate::hardware::{MockScanner, Scanner};
    use dactyl_core::DeviceId;
    use tempfile::TempDir;

    struct Rig {
        registry: RegistryHandle,
        hotplug_tx: mpsc::Sender<HotplugEvent>,
        idle_rx: mpsc::Receiver<()>,
        _store_dir: TempDir,
    }

    fn rig(idle_timeout: Option<Duration>) -> Rig {
        let store_dir = TempDir::new().unwrap();
        let store = Arc::new(TemplateStore::new(store_dir.path()));
        let (hotplug_tx, hotplug_rx) = mpsc::channel(8);
        let (idle_tx, idle_rx) = mpsc::channel(1);
        let registry = spawn_registry(
            store,
            Arc::new(Permissive),
            hotplug_rx,
            idle_timeout,
            idle_tx,
        );
        Rig {
            registry,
            hotplug_tx,
            idle_rx,
            _store_dir: store_dir,
        }
    }

    fn scanner(instance: &str) -> Arc<dyn Scanner> {
        Arc::new(MockScanner::new(
            DeviceId::new("mockdrv", instance),
            format!("Mock {instance}"),
        ))
    }

    #[tokio::test]
    async fn empty_registry_has_no_default() {
        let rig = rig(None);
        assert!(rig.registry.get_devices().await.unwrap().is_empty());
        assert!(matches!(
            rig.registry.get_default_device().await.unwrap_err(),
            Error::NoSuchDevice
        ));
    }

    #[tokio::test]
    async fn ordering_and_default() {
        let rig = rig(None);
        rig.hotplug_tx
            .send(HotplugEvent::Added(scanner("0001")))
            .await
            .unwrap();
        rig.hotplug_tx
            .send(HotplugEvent::Added(scanner("0002")))
            .await
            .unwrap();

        // Wait for both to be published
        let devices = loop {
            let devices = rig.registry.get_devices().await.unwrap();
            if devices.len() == 2 {
                break devices;
            }
            tokio::task::yield_now().await;
        };

        // Most recently added first
        assert_eq!(devices[0].device_id.instance, "0002");
        assert_eq!(devices[1].device_id.instance, "0001");

        // Default is the least recently added
        let default = rig.registry.get_default_device().await.unwrap();
        assert_eq!(default.device_id.instance, "0001");

        // Paths resolve
        let found = rig.registry.find(&devices[0].path).await.unwrap();
        assert_eq!(found.id, devices[0].id);
        assert!(matches!(
            rig.registry.find("/dactyl/device/99").await.unwrap_err(),
            Error::NoSuchDevice
        ));
    }

    #[tokio::test]
    async fn removal_unpublishes() {
        let rig = rig(None);
        rig.hotplug_tx
            .send(HotplugEvent::Added(scanner("0001")))
            .await
            .unwrap();
        rig.hotplug_tx
            .send(HotplugEvent::Removed(DeviceId::new("mockdrv", "0001")))
            .await
            .unwrap();

        loop {
            if rig.registry.get_devices().await.unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_when_unused() {
        let mut rig = rig(Some(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(31)).await;
        rig.idle_rx.recv().await.expect("idle expiry signal");
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_mode_never_fires() {
        let mut rig = rig(None);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(rig.idle_rx.try_recv().is_err());
    }
}
