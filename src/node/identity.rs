// Machine identity — stable UUID for each device.
//
// The machine id is written to ~/.overlay-agent/machine_id on first run and
// read back on every start after that. The file holds just the UUID string so
// other tooling on the device can read it.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Namespace for deriving machine ids from non-UUID device identifiers.
const MACHINE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f76_6572_6c61_7900_8000_6d61_6368_696e);

/// A device's identity towards the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Tenant this device belongs to
    pub organization_id: String,
    /// Stable UUID, never changes unless explicitly rotated
    pub machine_id: Uuid,
}

impl Identity {
    pub fn new(organization_id: impl Into<String>, machine_id: Uuid) -> Self {
        Self {
            organization_id: organization_id.into(),
            machine_id,
        }
    }

    /// Short display prefix (first 8 chars of the machine id)
    pub fn short_id(&self) -> String {
        self.machine_id.to_string()[..8].to_string()
    }
}

/// Turn a caller-provided machine id into a UUID.
///
/// UUID strings are used as-is. Anything else (serial numbers, "m-1") is
/// mapped to a UUID v5 so the same input always yields the same id.
pub fn machine_id_from_str(raw: &str) -> Result<Uuid> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AgentError::InvalidConfig("machine_id is empty".into()));
    }
    match Uuid::parse_str(raw) {
        Ok(id) => Ok(id),
        Err(_) => {
            let id = Uuid::new_v5(&MACHINE_ID_NAMESPACE, raw.as_bytes());
            tracing::debug!(raw, machine_id = %id, "Derived machine id from non-UUID identifier");
            Ok(id)
        }
    }
}

/// Read the persisted machine id at `path`, creating it on first use.
///
/// A new id is written to a uniquely named sibling temp file and hard-linked
/// into place, so a crash never leaves a truncated identity behind and
/// concurrent first runs all end up with whichever id was published first.
pub fn get_or_create_machine_id(path: &Path) -> Result<Uuid> {
    if path.exists() {
        return read_machine_id(path);
    }

    let id = Uuid::new_v4();
    let tmp_path = write_temp(path, &id)?;
    let published = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match published {
        Ok(()) => {
            tracing::info!(machine_id = %id, path = %path.display(), "Generated new machine identity");
            Ok(id)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => read_machine_id(path),
        Err(e) => Err(AgentError::Storage(format!(
            "failed to write identity {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_machine_id(path: &Path) -> Result<Uuid> {
    let raw = fs::read_to_string(path).map_err(|e| {
        AgentError::Storage(format!("failed to read identity {}: {}", path.display(), e))
    })?;
    Uuid::parse_str(raw.trim()).map_err(|e| {
        AgentError::Storage(format!("corrupt identity file {}: {}", path.display(), e))
    })
}

/// Build the full identity for `organization_id` from the file at `path`.
pub fn get_or_create_identity(path: &Path, organization_id: &str) -> Result<Identity> {
    let machine_id = get_or_create_machine_id(path)?;
    Ok(Identity::new(organization_id, machine_id))
}

/// Replace the persisted machine id with a fresh one.
pub fn rotate_machine_id(path: &Path) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let tmp_path = write_temp(path, &id)?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        AgentError::Storage(format!("failed to write identity {}: {}", path.display(), e))
    })?;
    tracing::info!(machine_id = %id, path = %path.display(), "Rotated machine identity");
    Ok(id)
}

/// Write `id` to a fresh temp file next to `path` and return its path.
fn write_temp(path: &Path, id: &Uuid) -> Result<PathBuf> {
    let storage_err =
        |what: &str, e: std::io::Error| AgentError::Storage(format!("{} {}: {}", what, path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| storage_err("failed to create directory for", e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".tmp-{}-{}", std::process::id(), Uuid::new_v4().simple()));
    let tmp_path = PathBuf::from(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp_path)?;
        file.write_all(id.to_string().as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    };

    match write() {
        Ok(()) => Ok(tmp_path),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(storage_err("failed to write identity", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_created_then_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("machine_id");

        let first = get_or_create_machine_id(&path).unwrap();
        assert!(path.exists());
        let second = get_or_create_machine_id(&path).unwrap();
        assert_eq!(first, second);

        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), first.to_string());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine_id");
        get_or_create_machine_id(&path).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine_id");
        fs::write(&path, "not-a-uuid").unwrap();
        assert!(matches!(
            get_or_create_machine_id(&path),
            Err(AgentError::Storage(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_directory_is_storage_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        let result = get_or_create_machine_id(&locked.join("machine_id"));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
        // Root ignores directory permissions, so only assert when the write failed.
        if result.is_err() {
            assert!(matches!(result, Err(AgentError::Storage(_))));
        }
    }

    #[test]
    fn test_concurrent_first_runs_agree() {
        use std::sync::{Arc, Barrier};

        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let path = Arc::new(dir.path().join("machine_id"));
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let path = path.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        get_or_create_machine_id(&path)
                    })
                })
                .collect();
            let ids: Vec<Uuid> = handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();

            let on_disk = Uuid::parse_str(fs::read_to_string(&*path).unwrap().trim()).unwrap();
            assert!(ids.iter().all(|id| *id == on_disk), "{:?} vs {}", ids, on_disk);
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        }
    }

    #[test]
    fn test_rotate_changes_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine_id");
        let first = get_or_create_machine_id(&path).unwrap();
        let rotated = rotate_machine_id(&path).unwrap();
        assert_ne!(first, rotated);
        assert_eq!(get_or_create_machine_id(&path).unwrap(), rotated);
    }

    #[test]
    fn test_machine_id_from_uuid_string() {
        let id = machine_id_from_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_machine_id_from_arbitrary_string_is_stable() {
        let a = machine_id_from_str("m-1").unwrap();
        let b = machine_id_from_str("m-1").unwrap();
        let c = machine_id_from_str("m-2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(machine_id_from_str("  ").is_err());
    }

    #[test]
    fn test_short_id() {
        let id = Identity::new(
            "org",
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
        );
        assert_eq!(id.short_id(), "550e8400");
    }
}
