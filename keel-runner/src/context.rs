//! Execution context for a single job
//!
//! Contains all state owned by one dispatch:
//! - The job record and the read-only records it was launched with
//! - The cancellation token of the job
//! - Scratch directories created for the run

use keel_core::domain::credential::Credential;
use keel_core::domain::job::Job;
use keel_core::domain::project::{Inventory, Project};
use keel_core::domain::template::JobTemplate;
use keel_core::domain::user::User;
use keel_core::dto::job::{JobPayload, PreviousJob};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-dispatch job context
///
/// Owned by exactly one consumer task for the lifetime of the job.
#[derive(Debug)]
pub struct JobContext<S> {
    pub job: Job<S>,
    pub template: JobTemplate,
    pub machine: Option<Credential>,
    pub network: Option<Credential>,
    pub scm: Option<Credential>,
    pub cloud: Option<Credential>,
    pub inventory: Option<Inventory>,
    pub project: Project,
    pub user: User,
    pub previous_job: Option<PreviousJob>,
    /// Callback token handed to the invoked tool. Never logged.
    pub token: String,
    /// Cancelled when the job is cancelled or the runner shuts down
    pub cancel: CancellationToken,
}

impl<S> JobContext<S> {
    pub fn new(payload: JobPayload<S>, cancel: CancellationToken) -> Self {
        Self {
            job: payload.job,
            template: payload.template,
            machine: payload.machine,
            network: payload.network,
            scm: payload.scm,
            cloud: payload.cloud,
            inventory: payload.inventory,
            project: payload.project,
            user: payload.user,
            previous_job: payload.previous_job,
            token: payload.token,
            cancel,
        }
    }

    /// Checkout directory of the job's project
    pub fn project_root(&self, projects_home: &Path) -> PathBuf {
        projects_home.join(self.project.id.to_string())
    }

    /// Cloud credential, if one is attached and flagged as cloud-backed
    pub fn cloud_credential(&self) -> Option<&Credential> {
        self.cloud.as_ref().filter(|c| c.cloud)
    }
}

/// Per-job scratch directories
///
/// Everything lives under one private temp directory that is removed on
/// [`JobPaths::cleanup`] or when the value is dropped.
#[derive(Debug)]
pub struct JobPaths {
    root: Option<TempDir>,
    pub etc: PathBuf,
    pub tmp: PathBuf,
    pub var_lib: PathBuf,
    pub job_status: PathBuf,
    pub projects: PathBuf,
    pub var_log: PathBuf,
    pub tmp_rand: PathBuf,
    pub credentials: PathBuf,
}

impl JobPaths {
    /// Creates the scratch tree under `base`
    pub fn create(base: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let root = tempfile::Builder::new()
            .prefix("keel_proot_")
            .tempdir_in(base)?;
        let dir = root.path().to_path_buf();

        let paths = Self {
            etc: dir.join("etc"),
            tmp: dir.join("tmp"),
            var_lib: dir.join("var_lib"),
            job_status: dir.join("job_status"),
            projects: dir.join("projects"),
            var_log: dir.join("var_log"),
            tmp_rand: dir.join("tmp_rand"),
            credentials: dir.join("credentials"),
            root: Some(root),
        };

        for sub in paths.directories() {
            create_private_dir(sub)?;
        }

        Ok(paths)
    }

    /// Root of the scratch tree
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(|r| r.path())
    }

    fn directories(&self) -> [&Path; 8] {
        [
            &self.etc,
            &self.tmp,
            &self.var_lib,
            &self.job_status,
            &self.projects,
            &self.var_log,
            &self.tmp_rand,
            &self.credentials,
        ]
    }

    /// Removes the scratch tree; calling it again is a no-op
    pub fn cleanup(&mut self) {
        if let Some(root) = self.root.take() {
            let path = root.path().to_path_buf();
            if let Err(e) = root.close() {
                warn!("Unable to remove job directories {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for JobPaths {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_paths_are_created_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let mut paths = JobPaths::create(base.path()).unwrap();

        let root = paths.root().unwrap().to_path_buf();
        assert!(paths.etc.is_dir());
        assert!(paths.credentials.is_dir());
        assert!(paths.tmp_rand.starts_with(&root));

        paths.cleanup();
        assert!(!root.exists());

        // second cleanup is harmless
        paths.cleanup();
    }

    #[test]
    fn test_job_paths_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let root = {
            let paths = JobPaths::create(base.path()).unwrap();
            paths.root().unwrap().to_path_buf()
        };
        assert!(!root.exists());
    }
}
