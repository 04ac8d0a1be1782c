//! File-backed template storage
//!
//! Layout: `<base>/<username>/<driver>/<instance>/<finger-code>` where
//! the finger code is a single hex digit. The layout is a compatibility
//! surface; directories are created 0700 and template files 0600.

use std::path::{Path, PathBuf};

use tracing::debug;

use dactyl_core::{DeviceId, Finger, Template};

use crate::error::{DaemonError, Result};

const DIR_PERMS: u32 = 0o700;
const FILE_PERMS: u32 = 0o600;

/// Per-user, per-device persistence of biometric templates.
pub struct TemplateStore {
    base: PathBuf,
}

impl TemplateStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn device_dir(&self, device_id: &DeviceId, username: &str) -> PathBuf {
        self.base
            .join(username)
            .join(&device_id.driver)
            .join(&device_id.instance)
    }

    fn template_path(&self, device_id: &DeviceId, finger: Finger, username: &str) -> PathBuf {
        self.device_dir(device_id, username).join(finger.code())
    }

    /// Persist a template under its `(device, finger, username)` key.
    pub fn save(&self, template: &Template) -> Result<()> {
        let path = self.template_path(&template.device_id, template.finger, &template.username);
        let dir = path.parent().expect("template path always has a parent");

        create_dir_private(dir)?;

        let content = serde_json::to_vec(template)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        set_file_private(&temp_path)?;
        std::fs::rename(&temp_path, &path)?;

        debug!("saved template to {:?}", path);
        Ok(())
    }

    /// Load the template for one finger of one user, if enrolled.
    pub fn load(&self, device_id: &DeviceId, finger: Finger, username: &str) -> Result<Template> {
        let path = self.template_path(device_id, finger, username);
        let content = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaemonError::TemplateNotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let template: Template = serde_json::from_slice(&content)?;

        // Refuse templates that were written for different hardware
        if template.device_id != *device_id {
            return Err(DaemonError::Store(format!(
                "template at {:?} belongs to device {}",
                path, template.device_id
            )));
        }

        Ok(template)
    }

    /// Delete one finger's template. Missing files are not an error.
    pub fn delete(&self, device_id: &DeviceId, finger: Finger, username: &str) -> Result<()> {
        let path = self.template_path(device_id, finger, username);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("deleted template {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the fingers a user has enrolled on a device, ascending.
    pub fn discover_fingers(&self, device_id: &DeviceId, username: &str) -> Result<Vec<Finger>> {
        let dir = self.device_dir(device_id, username);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut fingers = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match Finger::from_code(name) {
                Some(finger) => fingers.push(finger),
                None => debug!("skipping stray store file {:?}", entry.path()),
            }
        }

        fingers.sort();
        Ok(fingers)
    }

    /// List every username that has a storage directory.
    pub fn discover_users(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut users = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                users.push(name.to_string());
            }
        }

        Ok(users)
    }
}

fn create_dir_private(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(dir)?.permissions();
        perms.set_mode(DIR_PERMS);
        std::fs::set_permissions(dir, perms)?;
    }

    Ok(())
}

fn set_file_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(FILE_PERMS);
        std::fs::set_permissions(path, perms)?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dactyl_core::TemplateData;
    use tempfile::TempDir;

    fn template(finger: Finger, username: &str, payload: &[u8]) -> Template {
        Template {
            device_id: DeviceId::new("mockdrv", "0001"),
            finger,
            username: username.into(),
            enroll_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            payload: TemplateData::new(payload.to_vec()),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());

        let t = template(Finger::RightIndex, "alice", b"payload");
        store.save(&t).unwrap();

        let loaded = store
            .load(&t.device_id, Finger::RightIndex, "alice")
            .unwrap();
        assert_eq!(loaded, t);
    }

    #[test]
    fn delete_makes_load_fail() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());

        let t = template(Finger::LeftThumb, "alice", b"x");
        store.save(&t).unwrap();
        store.delete(&t.device_id, Finger::LeftThumb, "alice").unwrap();

        assert!(matches!(
            store.load(&t.device_id, Finger::LeftThumb, "alice"),
            Err(DaemonError::TemplateNotFound)
        ));

        // Deleting again is fine
        store.delete(&t.device_id, Finger::LeftThumb, "alice").unwrap();
    }

    #[test]
    fn discover_fingers_sorted() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());

        store.save(&template(Finger::RightThumb, "bob", b"a")).unwrap();
        store.save(&template(Finger::LeftIndex, "bob", b"b")).unwrap();

        let fingers = store
            .discover_fingers(&DeviceId::new("mockdrv", "0001"), "bob")
            .unwrap();
        assert_eq!(fingers, vec![Finger::LeftIndex, Finger::RightThumb]);

        // Unknown user has nothing
        let none = store
            .discover_fingers(&DeviceId::new("mockdrv", "0001"), "eve")
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn discover_users_lists_directories() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());

        store.save(&template(Finger::LeftRing, "alice", b"a")).unwrap();
        store.save(&template(Finger::LeftRing, "bob", b"b")).unwrap();

        let mut users = store.discover_users().unwrap();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn load_rejects_foreign_device() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path());

        let t = template(Finger::LeftLittle, "alice", b"x");
        store.save(&t).unwrap();

        // Manually copy the file under another device's directory
        let foreign = DeviceId::new("otherdrv", "ffff");
        let src = dir
            .path()
            .join("alice/mockdrv/0001")
            .join(Finger::LeftLittle.code());
        let dst_dir = dir.path().join("alice/otherdrv/ffff");
        std::fs::create_dir_all(&dst_dir).unwrap();
        std::fs::copy(&src, dst_dir.join(Finger::LeftLittle.code())).unwrap();

        assert!(store.load(&foreign, Finger::LeftLittle, "alice").is_err());
    }
}
