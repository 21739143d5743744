/// Workspace management for run-scoped artifacts
/// Each submission gets its own directory under the runtime root, mounted
/// read-only into the container and removed once the run is over.
use crate::config::types::{LauncherError, Mount, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directories must be traversable by the unprivileged run identity.
const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Per-user root for launcher artifacts: `$TMPDIR/runbox-uid-<euid>`
pub fn runtime_root_dir() -> PathBuf {
    let euid = nix::unistd::geteuid().as_raw();
    std::env::temp_dir().join(format!("runbox-uid-{}", euid))
}

fn io_context(e: std::io::Error, what: &str, path: &Path) -> LauncherError {
    LauncherError::Io(std::io::Error::new(
        e.kind(),
        format!("{} {}: {}", what, path.display(), e),
    ))
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| io_context(e, "Failed to create directory", path))?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))
        .map_err(|e| io_context(e, "Failed to set permissions on", path))
}

/// Workspace for one run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    /// Files written by the launcher
    files: Vec<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    /// Create new workspace for a run
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);
        create_dir_with_mode(&run_dir)?;

        Ok(Self {
            run_id,
            run_dir,
            files: Vec::new(),
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write a file directly under the run directory.
    pub fn write_file(&mut self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(LauncherError::InvalidRequest(format!(
                "workspace file name must be a plain name: {:?}",
                name
            )));
        }
        let path = self.run_dir.join(name);
        fs::write(&path, content).map_err(|e| io_context(e, "Failed to write", &path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(FILE_MODE))
            .map_err(|e| io_context(e, "Failed to set permissions on", &path))?;
        self.files.push(path.clone());
        Ok(path)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Read-only mount of this workspace at `container_path`
    pub fn mount(&self, container_path: &str) -> Mount {
        Mount {
            host_path: self.run_dir.clone(),
            container_path: PathBuf::from(container_path),
            read_only: true,
        }
    }

    /// Remove the run directory (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        match fs::remove_dir_all(&self.run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_context(e, "Failed to remove workspace", &self.run_dir)),
        }
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

/// Creates workspaces under one base directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        create_dir_with_mode(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Manager rooted at [`runtime_root_dir`]
    pub fn at_runtime_root() -> Result<Self> {
        Self::new(runtime_root_dir())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove leftover workspaces older than `max_age`.
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_context(e, "Failed to read", &self.base_dir)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = fs::symlink_metadata(&path) else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if matches!(age, Some(age) if age > max_age) {
                log::info!("Cleaning up stale workspace: {}", path.display());
                match fs::remove_dir_all(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(tag: &str) -> WorkspaceManager {
        let base = std::env::temp_dir().join(format!("runbox_test_{}_{}", tag, Uuid::new_v4()));
        WorkspaceManager::new(base).unwrap()
    }

    #[test]
    fn runtime_root_is_scoped_by_uid() {
        let root = runtime_root_dir();
        let name = root.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("runbox-uid-"));
    }

    #[test]
    fn workspace_files_are_readable_by_others() {
        let manager = manager("files");
        let mut workspace = manager.create_workspace().unwrap();
        let path = workspace.write_file("main.py", b"print(1)").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
        let dir_mode = fs::metadata(workspace.run_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, DIR_MODE);
        assert_eq!(workspace.files().len(), 1);

        let _ = fs::remove_dir_all(manager.base_dir());
    }

    #[test]
    fn nested_names_are_rejected() {
        let manager = manager("names");
        let mut workspace = manager.create_workspace().unwrap();
        for bad in ["", "..", "a/b", "/etc/passwd"] {
            assert!(workspace.write_file(bad, b"x").is_err(), "{bad:?}");
        }
        let _ = fs::remove_dir_all(manager.base_dir());
    }

    #[test]
    fn cleanup_is_idempotent_and_runs_on_drop() {
        let manager = manager("cleanup");
        let mut workspace = manager.create_workspace().unwrap();
        let dir = workspace.run_dir().to_path_buf();
        workspace.write_file("Main.java", b"class Main {}").unwrap();

        workspace.cleanup().unwrap();
        workspace.cleanup().unwrap();
        assert!(!dir.exists());

        let dropped = manager.create_workspace().unwrap();
        let dropped_dir = dropped.run_dir().to_path_buf();
        drop(dropped);
        assert!(!dropped_dir.exists());

        let _ = fs::remove_dir_all(manager.base_dir());
    }

    #[test]
    fn mount_is_read_only() {
        let manager = manager("mount");
        let workspace = manager.create_workspace().unwrap();
        let mount = workspace.mount("/app");
        assert!(mount.read_only);
        assert_eq!(mount.host_path, workspace.run_dir());
        assert_eq!(mount.container_path, PathBuf::from("/app"));
        drop(workspace);
        let _ = fs::remove_dir_all(manager.base_dir());
    }

    #[test]
    fn stale_workspaces_are_collected() {
        let manager = manager("stale");
        let workspace = manager.create_workspace().unwrap();
        let dir = workspace.run_dir().to_path_buf();
        std::mem::forget(workspace);

        std::thread::sleep(Duration::from_millis(50));
        let cleaned = manager.cleanup_old_workspaces(Duration::ZERO).unwrap();
        assert_eq!(cleaned, 1);
        assert!(!dir.exists());
        let _ = fs::remove_dir_all(manager.base_dir());
    }
}
