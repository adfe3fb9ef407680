use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{SnippetBackend, SnippetSettings};
use crate::errors::{StorageError, StorageResult};

/// Shared storage the hypervisor reads cloud-init user-data from.
#[async_trait]
pub trait SnippetStorage: Send + Sync {
    async fn stage(&self, filename: &str, contents: &str) -> StorageResult<()>;

    /// Removing a file that does not exist is not an error.
    async fn remove(&self, filename: &str) -> StorageResult<()>;

    /// Volume id for `cicustom`, e.g. `cephfs:snippets/3-7-12.yaml`.
    fn volume_ref(&self, filename: &str) -> String;
}

pub fn from_settings(settings: &SnippetSettings) -> Arc<dyn SnippetStorage> {
    match settings.backend {
        SnippetBackend::Local => Arc::new(LocalSnippetStorage::new(
            settings.storage_id.clone(),
            settings.local_dir.clone(),
        )),
        SnippetBackend::Scp => Arc::new(ScpSnippetStorage::from_settings(settings)),
    }
}

fn check_filename(filename: &str) -> StorageResult<()> {
    let valid = !filename.is_empty()
        && !filename.starts_with('.')
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidFilename(filename.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn write_atomically(dir: &Path, filename: &str, contents: &str) -> StorageResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    let target = dir.join(filename);
    let partial = dir.join(format!(".{filename}.partial"));
    tokio::fs::write(&partial, contents)
        .await
        .map_err(io_error(&partial))?;
    tokio::fs::rename(&partial, &target)
        .await
        .map_err(io_error(&target))?;
    Ok(target)
}

/// Snippet directory mounted on this host (e.g. CephFS).
#[derive(Debug, Clone)]
pub struct LocalSnippetStorage {
    storage_id: String,
    dir: PathBuf,
}

impl LocalSnippetStorage {
    pub fn new(storage_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_id: storage_id.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl SnippetStorage for LocalSnippetStorage {
    async fn stage(&self, filename: &str, contents: &str) -> StorageResult<()> {
        check_filename(filename)?;
        let path = write_atomically(&self.dir, filename, contents).await?;
        debug!(path = %path.display(), "Snippet staged");
        Ok(())
    }

    async fn remove(&self, filename: &str) -> StorageResult<()> {
        check_filename(filename)?;
        let path = self.dir.join(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn volume_ref(&self, filename: &str) -> String {
        format!("{}:snippets/{}", self.storage_id, filename)
    }
}

/// Copies snippets to a file server with `scp` and removes them with `ssh`.
#[derive(Debug, Clone)]
pub struct ScpSnippetStorage {
    storage_id: String,
    host: String,
    user: String,
    remote_dir: String,
    identity_file: PathBuf,
    staging_dir: PathBuf,
}

impl ScpSnippetStorage {
    pub fn from_settings(settings: &SnippetSettings) -> Self {
        Self {
            storage_id: settings.storage_id.clone(),
            host: settings.remote_host.clone(),
            user: settings.remote_user.clone(),
            remote_dir: settings.remote_dir.trim_end_matches('/').to_string(),
            identity_file: settings.identity_file.clone(),
            staging_dir: settings.staging_dir.clone(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_options(&self, command: &mut Command) {
        command
            .arg("-i")
            .arg(&self.identity_file)
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]);
    }

    async fn run(&self, name: &str, command: &mut Command) -> StorageResult<()> {
        let output: Output = command
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StorageError::Io {
                path: name.to_string(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(StorageError::RemoteCommand {
            command: name.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl SnippetStorage for ScpSnippetStorage {
    async fn stage(&self, filename: &str, contents: &str) -> StorageResult<()> {
        check_filename(filename)?;
        let local = write_atomically(&self.staging_dir, filename, contents).await?;

        let mut scp = Command::new("scp");
        self.ssh_options(&mut scp);
        scp.arg(&local)
            .arg(format!("{}:{}/{}", self.destination(), self.remote_dir, filename));
        let copied = self.run("scp", &mut scp).await;

        // The staged copy is scratch either way.
        let _ = tokio::fs::remove_file(&local).await;
        copied?;

        info!(filename, host = %self.host, "Snippet uploaded");
        Ok(())
    }

    async fn remove(&self, filename: &str) -> StorageResult<()> {
        check_filename(filename)?;
        let mut ssh = Command::new("ssh");
        self.ssh_options(&mut ssh);
        ssh.arg(self.destination())
            .arg(format!("rm -f -- '{}/{}'", self.remote_dir, filename));
        self.run("ssh rm", &mut ssh).await
    }

    fn volume_ref(&self, filename: &str) -> String {
        format!("{}:snippets/{}", self.storage_id, filename)
    }
}
