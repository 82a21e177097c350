use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt, chown};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::bail;
use chrono::Local;
use parking_lot::Mutex;

use crate::config::RunAs;

// Others may traverse the root but not list it
const ROOT_PERMISSIONS: u32 = 0o711;
const WORKSPACE_PERMISSIONS: u32 = 0o700;
const INPUT_FILE_NAME: &str = "input.txt";
const ALLOCATION_ATTEMPTS: usize = 3;

/// Paths of the workspaces currently owned by an execution
#[derive(Debug, Default)]
pub struct LiveWorkspaces(Mutex<HashSet<PathBuf>>);

impl LiveWorkspaces {
    fn insert(&self, dir: PathBuf) {
        self.0.lock().insert(dir);
    }

    fn remove(&self, dir: &Path) {
        self.0.lock().remove(dir);
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.0.lock().contains(dir)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory under which every workspace is allocated
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    path: PathBuf,
    owner: Option<RunAs>,
    live: Arc<LiveWorkspaces>,
}

impl WorkspaceRoot {
    /// Creates the root directory if needed. The path is made absolute so that
    /// every placeholder expanded from it is absolute as well.
    ///
    /// An existing directory is used as is, but only if this process owns it
    /// and nobody else can write to it.
    pub fn create(path: impl AsRef<Path>, owner: Option<RunAs>) -> anyhow::Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::DirBuilder::new().mode(ROOT_PERMISSIONS).create(&path) {
            Ok(()) => {
                // The umask may have cleared bits of the requested mode
                fs::set_permissions(&path, fs::Permissions::from_mode(ROOT_PERMISSIONS))?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                check_existing_root(&path, owner.is_some())?;
            }
            Err(e) => return Err(e.into()),
        }

        log::info!("Workspace root ready at {}", path.display());
        Ok(Self {
            path,
            owner,
            live: Arc::new(LiveWorkspaces::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn live(&self) -> &Arc<LiveWorkspaces> {
        &self.live
    }

    /// Creates a fresh, uniquely named workspace directory.
    ///
    /// `create_dir` fails on an existing path, so two requests can never end up
    /// sharing a directory even if their random tokens collide.
    pub async fn allocate(&self) -> io::Result<Workspace> {
        for _ in 0..ALLOCATION_ATTEMPTS {
            let id = generate_workspace_id();
            let dir = self.path.join(&id);

            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    self.live.insert(dir.clone());
                    // From here on, dropping the handle removes the directory
                    let workspace = Workspace {
                        id,
                        dir,
                        live: self.live.clone(),
                        released: false,
                    };

                    tokio::fs::set_permissions(
                        &workspace.dir,
                        fs::Permissions::from_mode(WORKSPACE_PERMISSIONS),
                    )
                    .await?;
                    if let Some(owner) = self.owner {
                        chown(&workspace.dir, Some(owner.uid), Some(owner.gid))?;
                    }

                    log::debug!("Allocated workspace {}", workspace.id);
                    return Ok(workspace);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::warn!("Workspace name {id} already taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "unable to find a free workspace name",
        ))
    }

    /// Removes directories under the root that no execution owns and that are
    /// at least `min_age` old. Returns how many were removed.
    pub fn sweep(&self, min_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Unable to read workspace root {}: {e}", self.path.display());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            // Only names this service could have allocated are ever touched
            if !entry.file_name().to_str().is_some_and(is_workspace_id) {
                continue;
            }
            let path = entry.path();
            if !entry.file_type().is_ok_and(|t| t.is_dir()) || self.live.contains(&path) {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    log::info!("Removed stale workspace {}", path.display());
                    removed += 1;
                }
                Err(e) => log::warn!("Unable to remove stale workspace {}: {e}", path.display()),
            }
        }

        removed
    }
}

/// An exclusively owned, disposable directory for one execution attempt
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
    live: Arc<LiveWorkspaces>,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE_NAME)
    }

    pub async fn write_input(&self, stdin: &str) -> io::Result<()> {
        tokio::fs::write(self.input_path(), stdin).await
    }

    pub async fn write_source(&self, file_name: &str, source: &str) -> io::Result<PathBuf> {
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, source).await?;
        Ok(path)
    }

    /// Deletes the directory and everything in it. Failures are logged only.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => log::debug!("Released workspace {}", self.id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to remove workspace {}: {e}", self.id),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Workspace {} dropped before release, removing", self.id);
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::error!("Failed to remove workspace {}: {e}", self.id);
                }
            }
        }
        self.live.remove(&self.dir);
    }
}

fn check_existing_root(path: &Path, traversable: bool) -> anyhow::Result<()> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_dir() {
        bail!("Workspace root {} is not a directory", path.display());
    }
    if metadata.uid() != unsafe { libc::geteuid() } {
        bail!(
            "Workspace root {} is owned by uid {}, not by this process",
            path.display(),
            metadata.uid()
        );
    }
    let mode = metadata.permissions().mode();
    if mode & 0o022 != 0 {
        bail!(
            "Workspace root {} is writable by other users (mode {:o})",
            path.display(),
            mode & 0o7777
        );
    }
    // The dedicated user has to reach its own workspace below the root
    if traversable && mode & 0o001 == 0 {
        bail!(
            "Workspace root {} must be searchable by others (mode {:o}) when run_as is set",
            path.display(),
            mode & 0o7777
        );
    }
    Ok(())
}

/// Whether `name` has the shape produced by `generate_workspace_id`
fn is_workspace_id(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 30
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            6 | 13 => *b == b'-',
            0..=12 => b.is_ascii_digit(),
            _ => b.is_ascii_digit() || (b'a'..=b'f').contains(b),
        })
}

/// Timestamp prefix for readability plus a 64-bit random token
fn generate_workspace_id() -> String {
    format!(
        "{}-{:016x}",
        Local::now().format("%y%m%d-%H%M%S"),
        rand::random::<u64>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_workspace_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| is_workspace_id(id)));
    }

    #[test]
    fn test_is_workspace_id() {
        assert!(is_workspace_id("250101-000000-00000000deadbeef"));
        assert!(!is_workspace_id("250101-000000-00000000DEADBEEF"));
        assert!(!is_workspace_id("250101-000000-00000000deadbee"));
        assert!(!is_workspace_id("leftover-from-crash"));
        assert!(!is_workspace_id("systemd-private-0123456789abcdef"));
    }

    #[test]
    fn test_new_root_is_only_traversable() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::create(tmp.path().join("a/b"), None).unwrap();
        let mode = fs::metadata(root.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, ROOT_PERMISSIONS);
    }

    #[test]
    fn test_shared_directory_is_refused_and_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir(&shared).unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o1777)).unwrap();

        assert!(WorkspaceRoot::create(&shared, None).is_err());
        let mode = fs::metadata(&shared).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o1777);

        fs::set_permissions(&shared, fs::Permissions::from_mode(0o770)).unwrap();
        assert!(WorkspaceRoot::create(&shared, None).is_err());
    }

    #[test]
    fn test_existing_root_needs_search_bit_for_dedicated_user() {
        let tmp = tempfile::tempdir().unwrap();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let run_as = RunAs { uid: 65534, gid: 65534 };

        assert!(WorkspaceRoot::create(tmp.path(), Some(run_as)).is_err());
        assert!(WorkspaceRoot::create(tmp.path(), None).is_ok());
        // Never modified
        let mode = fs::metadata(tmp.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::create(tmp.path().join("ws"), None).unwrap();

        let a = root.allocate().await.unwrap();
        let b = root.allocate().await.unwrap();
        assert_ne!(a.dir(), b.dir());
        assert!(a.dir().is_dir() && b.dir().is_dir());
        assert_eq!(root.live().len(), 2);

        let mode = fs::metadata(a.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, WORKSPACE_PERMISSIONS);

        a.write_input("1 2\n").await.unwrap();
        let source = a.write_source("main.py", "print(1)").await.unwrap();
        assert_eq!(fs::read_to_string(a.input_path()).unwrap(), "1 2\n");
        assert_eq!(fs::read_to_string(source).unwrap(), "print(1)");
        // Files of one workspace are not visible from another
        assert!(!b.dir().join("main.py").exists());

        let (a_dir, b_dir) = (a.dir().to_path_buf(), b.dir().to_path_buf());
        a.release().await;
        b.release().await;
        assert!(!a_dir.exists());
        assert!(!b_dir.exists());
        assert!(root.live().is_empty());
    }

    #[tokio::test]
    async fn test_drop_removes_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::create(tmp.path(), None).unwrap();

        let ws = root.allocate().await.unwrap();
        ws.write_input("data").await.unwrap();
        let dir = ws.dir().to_path_buf();
        drop(ws);

        assert!(!dir.exists());
        assert!(root.live().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::create(tmp.path(), None).unwrap();

        let stale = tmp.path().join("250101-000000-00000000deadbeef");
        fs::create_dir_all(stale.join("nested")).unwrap();
        fs::write(stale.join("nested/main.cpp"), "int main(){}").unwrap();
        let live = root.allocate().await.unwrap();

        assert_eq!(root.sweep(Duration::from_secs(3600)), 0);
        assert!(stale.exists());

        assert_eq!(root.sweep(Duration::ZERO), 1);
        assert!(!stale.exists());
        assert!(live.dir().exists());

        live.release().await;
    }

    #[test]
    fn test_sweep_leaves_foreign_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::create(tmp.path(), None).unwrap();

        let foreign = tmp.path().join("someone-elses-dir");
        fs::create_dir(&foreign).unwrap();
        fs::write(tmp.path().join("250101-000000-00000000deadbeef"), "a file").unwrap();

        assert_eq!(root.sweep(Duration::ZERO), 0);
        assert!(foreign.is_dir());
        assert!(tmp.path().join("250101-000000-00000000deadbeef").is_file());
    }
}
