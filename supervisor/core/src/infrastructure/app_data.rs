// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// App-Data Directory
//
// The per-installation directory holding logs, per-service data, the secrets
// vault and run-state. At most one supervisor owns it at a time: the owner
// holds an exclusive advisory lock on `run/supervisor.lock` for the whole
// session. The PID written into the file is diagnostic only. The OS drops
// the lock when the owner exits, so a crashed supervisor never blocks the
// next one.

use crate::domain::error::AppDataError;
use crate::domain::manifest::{is_safe_relative, AppDataLayout};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "supervisor.lock";

/// Resolved locations under the app-data root.
#[derive(Debug, Clone)]
pub struct AppDataDir {
    root: PathBuf,
    layout: AppDataLayout,
}

impl AppDataDir {
    pub fn new(root: impl Into<PathBuf>, layout: AppDataLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(&self.layout.logs)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(&self.layout.data)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.layout.run)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.run_dir().join(LOCK_FILE_NAME)
    }

    /// `<data>/<service-id>`
    pub fn service_data_dir(&self, service_id: &str) -> PathBuf {
        self.data_dir().join(service_id)
    }

    /// Take the session lock. Only the root and run directory are created
    /// before the lock is held.
    pub fn acquire_lock(&self) -> Result<SessionLock, AppDataError> {
        let run_dir = self.run_dir();
        std::fs::create_dir_all(&run_dir).map_err(|e| AppDataError::io(&run_dir, e))?;

        let path = self.lock_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AppDataError::io(&path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(AppDataError::io(&path, e));
            }
            let pid = read_lock_pid(&path);
            debug!(lock = ?path, owner = ?pid, "App-data lock is held");
            return Err(AppDataError::Locked { pid, path });
        }

        let pid = std::process::id();
        write_owner(&mut file, pid).map_err(|e| AppDataError::io(&path, e))?;
        info!(lock = ?path, pid, "Acquired app-data lock");
        Ok(SessionLock {
            path,
            file: Some(file),
        })
    }

    /// Create every layout sub-path. Call while holding the lock.
    pub fn ensure_layout(&self) -> Result<(), AppDataError> {
        for sub_path in self.layout.sub_paths() {
            if !is_safe_relative(sub_path) {
                return Err(AppDataError::InvalidLayout(format!(
                    "'{}' must be a relative path without '..'",
                    sub_path
                )));
            }
            let dir = self.root.join(sub_path);
            std::fs::create_dir_all(&dir).map_err(|e| AppDataError::io(&dir, e))?;
            debug!(dir = ?dir, "Ensured app-data directory");
        }
        Ok(())
    }

    pub fn ensure_service_data_dir(&self, service_id: &str) -> Result<PathBuf, AppDataError> {
        let dir = self.service_data_dir(service_id);
        std::fs::create_dir_all(&dir).map_err(|e| AppDataError::io(&dir, e))?;
        Ok(dir)
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn write_owner(file: &mut File, pid: u32) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", pid)?;
    file.sync_data()
}

/// Held for the lifetime of a session. Releasing (or dropping) clears the
/// owner PID and unlocks; the file itself stays in place so every contender
/// locks the same inode.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    file: Option<File>,
}

impl SessionLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(e) = file.set_len(0) {
            warn!(lock = ?self.path, "Failed to clear app-data lock owner: {}", e);
        }
        match FileExt::unlock(&file) {
            Ok(()) => debug!(lock = ?self.path, "Released app-data lock"),
            Err(e) => warn!(lock = ?self.path, "Failed to unlock app-data lock: {}", e),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_data(root: &Path) -> AppDataDir {
        AppDataDir::new(root, AppDataLayout::default())
    }

    fn owner(app: &AppDataDir) -> String {
        std::fs::read_to_string(app.lock_path()).unwrap()
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_data(dir.path());

        let lock = app.acquire_lock().unwrap();
        assert_eq!(owner(&app).trim(), std::process::id().to_string());

        // A second session in this process opens its own handle and is refused.
        let err = app.acquire_lock().unwrap_err();
        assert!(matches!(err, AppDataError::Locked { pid: Some(pid), .. } if pid == std::process::id()));

        lock.release();
        assert!(owner(&app).is_empty());
        assert!(app.acquire_lock().is_ok());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_data(dir.path());
        {
            let _lock = app.acquire_lock().unwrap();
        }
        assert!(owner(&app).is_empty());
        assert!(app.acquire_lock().is_ok());
    }

    #[test]
    fn test_lock_held_before_owner_is_written_still_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_data(dir.path());
        std::fs::create_dir_all(app.run_dir()).unwrap();

        // A contender that has locked the file but not yet written its PID.
        let contender = File::create(app.lock_path()).unwrap();
        contender.lock_exclusive().unwrap();

        let err = app.acquire_lock().unwrap_err();
        assert!(matches!(err, AppDataError::Locked { pid: None, .. }));
        assert!(owner(&app).is_empty(), "contender's file must be left alone");

        FileExt::unlock(&contender).unwrap();
        assert!(app.acquire_lock().is_ok());
    }

    #[test]
    fn test_leftover_lock_file_without_holder_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_data(dir.path());
        std::fs::create_dir_all(app.run_dir()).unwrap();
        std::fs::write(app.lock_path(), "4194303\n").unwrap();

        let _lock = app.acquire_lock().unwrap();
        assert_eq!(owner(&app).trim(), std::process::id().to_string());
    }

    #[test]
    fn test_ensure_layout_creates_all_paths() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AppDataLayout {
            extra: vec!["cache/models".to_string()],
            ..Default::default()
        };
        let app = AppDataDir::new(dir.path().join("app"), layout);
        let _lock = app.acquire_lock().unwrap();
        app.ensure_layout().unwrap();

        for sub in ["logs", "data", "secrets", "run", "cache/models"] {
            assert!(dir.path().join("app").join(sub).is_dir(), "{} missing", sub);
        }
        let db = app.ensure_service_data_dir("db").unwrap();
        assert!(db.ends_with("data/db") && db.is_dir());
    }
}
