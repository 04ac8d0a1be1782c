//! Dactyl Daemon - brokers fingerprint scanner hardware
//!
//! This crate provides:
//! - Per-device controllers with claim/release arbitration
//! - Asynchronous enroll/verify/identify with automatic retry
//! - File-backed template storage per user and device
//! - Device registry with hotplug and an idle-exit timeout
//! - IPC server for client communication

pub mod access;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod ipc;
pub mod registry;
pub mod store;

pub use config::DaemonConfig;
pub use device::{DeviceHandle, DeviceInfo, DeviceSignal};
pub use error::{DaemonError, Result};
pub use hardware::{CancelFlag, HotplugEvent, MockScanner, Scanner};
pub use ipc::{IpcClient, IpcServer};
pub use registry::RegistryHandle;
pub use store::TemplateStore;
