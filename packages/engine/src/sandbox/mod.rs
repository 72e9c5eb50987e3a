//! Per-session sandbox provisioning: a bounded FIFO pool of non-root
//! identities, each paired with a disposable scratch root and (when the
//! host allows) a cgroup.

pub mod cgroup;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// One entry of the identity pool: the unit of process/file ownership
/// isolation between concurrent sessions.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub box_id: u32,
    pub uid: u32,
    pub gid: u32,
}

/// A provisioned sandbox, owned exclusively by one job until released.
#[derive(Debug)]
pub struct SandboxHandle {
    pub id: String,
    pub root: PathBuf,
    pub tmp: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Whether the pool runs with root privileges: uid drops, chown, and
    /// cgroups apply only then.
    pub privileged: bool,
    pub cgroup: Option<PathBuf>,
    /// Present until the handle is released back to the pool.
    identity: Option<Identity>,
}

impl SandboxHandle {
    pub fn is_released(&self) -> bool {
        self.identity.is_none()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.identity.is_some() {
            warn!(sandbox = %self.id, "sandbox dropped without release; identity leaked");
        }
    }
}

/// Fixed-size pool of sandbox identities with fair FIFO acquisition.
pub struct SandboxPool {
    root: PathBuf,
    privileged: bool,
    cgroup_base: Option<PathBuf>,
    slots: Mutex<mpsc::Receiver<Identity>>,
    returns: mpsc::Sender<Identity>,
}

impl SandboxPool {
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        let size = config.max_concurrent_jobs.max(1);
        let (returns, slots) = mpsc::channel(size);
        for n in 0..size as u32 {
            let identity = Identity {
                box_id: n,
                uid: config.runner_uid_start + n,
                gid: config.runner_gid_start + n,
            };
            returns
                .try_send(identity)
                .expect("pool channel sized to hold every identity");
        }
        let privileged = Uid::effective().is_root();
        if !privileged {
            warn!("not running as root; sandbox ownership isolation is degraded");
        }
        Arc::new(Self {
            root: PathBuf::from(&config.sandbox_root),
            privileged,
            cgroup_base: if privileged { cgroup::detect_base() } else { None },
            slots: Mutex::new(slots),
            returns,
        })
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// Reserve an identity (FIFO, suspending while the pool is busy) and
    /// provision its scratch root. Any provisioning failure returns the
    /// identity before surfacing `SandboxSetupFailed`.
    pub async fn acquire(&self) -> Result<SandboxHandle, EngineError> {
        let identity = {
            let mut slots = self.slots.lock().await;
            slots.recv().await.ok_or(EngineError::PoolExhausted)?
        };
        match self.provision(identity).await {
            Ok(handle) => {
                debug!(sandbox = %handle.id, uid = identity.uid, "sandbox acquired");
                Ok(handle)
            }
            Err(err) => {
                let _ = self.returns.send(identity).await;
                Err(EngineError::SandboxSetup(err.to_string()))
            }
        }
    }

    async fn provision(&self, identity: Identity) -> std::io::Result<SandboxHandle> {
        tokio::fs::create_dir_all(&self.root).await?;
        if self.privileged {
            // Identities need traverse permission down to their own box.
            tokio::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o711)).await?;
        }
        let id = format!("box-{}-{}", identity.box_id, short_id());
        let root = self.root.join(&id);
        tokio::fs::create_dir(&root).await?;
        let tmp = root.join("tmp");
        if let Err(err) = prepare_scratch(&root, &tmp, identity, self.privileged).await {
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(err);
        }

        let cgroup = self.cgroup_base.as_deref().and_then(|base| {
            match cgroup::create(base, &format!("gavel-{id}")) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(sandbox = %id, error = %err, "cgroup creation failed; using procfs accounting");
                    None
                }
            }
        });

        Ok(SandboxHandle {
            id,
            root,
            tmp,
            uid: identity.uid,
            gid: identity.gid,
            privileged: self.privileged,
            cgroup,
            identity: Some(identity),
        })
    }

    /// Tear a sandbox down and return its identity to the pool. Idempotent;
    /// errors are logged, never surfaced.
    pub async fn release(&self, handle: &mut SandboxHandle) {
        let Some(identity) = handle.identity.take() else {
            return;
        };
        if let Some(cg) = handle.cgroup.take() {
            cgroup::destroy(&cg);
        }
        if self.privileged {
            kill_identity_processes(identity.uid).await;
        }
        if let Err(err) = tokio::fs::remove_dir_all(&handle.root).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox = %handle.id, error = %err, "failed to remove sandbox root");
            }
        }
        debug!(sandbox = %handle.id, uid = identity.uid, "sandbox released");
        if self.returns.send(identity).await.is_err() {
            warn!(sandbox = %handle.id, "identity pool closed during release");
        }
    }
}

/// Rebuild the writable scratch `tmp/` of a sandbox, wiping any residue.
pub async fn reset_tmp(handle: &SandboxHandle, privileged: bool) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(&handle.tmp).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    create_tmp(&handle.tmp, handle.uid, handle.gid, privileged).await
}

async fn prepare_scratch(
    root: &Path,
    tmp: &Path,
    identity: Identity,
    privileged: bool,
) -> std::io::Result<()> {
    if privileged {
        chown(
            root,
            Some(Uid::from_raw(identity.uid)),
            Some(Gid::from_raw(identity.gid)),
        )
        .map_err(std::io::Error::from)?;
        tokio::fs::set_permissions(root, std::fs::Permissions::from_mode(0o700)).await?;
    }
    create_tmp(tmp, identity.uid, identity.gid, privileged).await
}

async fn create_tmp(tmp: &Path, uid: u32, gid: u32, privileged: bool) -> std::io::Result<()> {
    tokio::fs::create_dir(tmp).await?;
    // Executable scratch: interpreters and build tools stage helpers here.
    tokio::fs::set_permissions(tmp, std::fs::Permissions::from_mode(0o1777)).await?;
    if privileged {
        chown(
            tmp,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .map_err(std::io::Error::from)?;
    }
    Ok(())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// SIGKILL every process owned by `uid`, repeating until a sweep of
/// `/proc` finds none. Identities must re-enter the pool clean.
async fn kill_identity_processes(uid: u32) {
    for _ in 0..20 {
        let survivors = tokio::task::spawn_blocking(move || sweep_uid(uid))
            .await
            .unwrap_or(0);
        if survivors == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    warn!(uid, "processes survived identity cleanup sweeps");
}

fn sweep_uid(uid: u32) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    let mut killed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(status) = std::fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        let owned = status.lines().any(|line| {
            line.strip_prefix("Uid:")
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|real| real.parse::<u32>().ok())
                == Some(uid)
        });
        if owned {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path, jobs: usize) -> EngineConfig {
        let mut cfg = EngineConfig::load().unwrap();
        cfg.sandbox_root = root.to_string_lossy().to_string();
        cfg.max_concurrent_jobs = jobs;
        cfg
    }

    #[tokio::test]
    async fn acquire_provisions_root_and_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SandboxPool::new(&test_config(dir.path(), 2));
        let mut handle = pool.acquire().await.unwrap();
        assert!(handle.root.is_dir());
        assert!(handle.tmp.is_dir());
        assert!(!handle.is_released());
        pool.release(&mut handle).await;
        assert!(handle.is_released());
        assert!(!handle.root.exists());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SandboxPool::new(&test_config(dir.path(), 1));
        let mut handle = pool.acquire().await.unwrap();
        pool.release(&mut handle).await;
        pool.release(&mut handle).await;
        // The identity went back exactly once: a second acquire succeeds.
        let mut again = pool.acquire().await.unwrap();
        pool.release(&mut again).await;
    }

    #[tokio::test]
    async fn pool_blocks_until_an_identity_returns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SandboxPool::new(&test_config(dir.path(), 1));
        let mut held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(&mut held).await;
        let mut next = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap()
            .unwrap();
        pool.release(&mut next).await;
    }

    #[tokio::test]
    async fn reset_tmp_wipes_residue() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SandboxPool::new(&test_config(dir.path(), 1));
        let mut handle = pool.acquire().await.unwrap();

        tokio::fs::write(handle.tmp.join("residue"), b"x").await.unwrap();
        reset_tmp(&handle, pool.privileged()).await.unwrap();
        assert!(handle.tmp.is_dir());
        assert!(!handle.tmp.join("residue").exists());
        pool.release(&mut handle).await;
    }
}
