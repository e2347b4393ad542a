//! Scenario file sets per application on a server
//!
//! A replace is write-then-activate: new files are uploaded to a staging
//! directory first, then moved into place, then stale files are removed.
//! Replaces for the same (application, server) pair are serialized; other
//! pairs proceed in parallel. A failed replace removes its staging directory
//! and leaves the active files untouched.

use async_trait::async_trait;
use bastion_common::{Server, ServerId};
use dashmap::DashMap;
use metrics::counter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::compiler::ScenarioFile;
use crate::error::Result;
use crate::remote::{shell_quote, RemoteExecutor};

#[async_trait]
pub trait ScenarioStore: Send + Sync + 'static {
    /// Make the application's scenario files on `server` exactly `files`.
    ///
    /// `is_current` is asked once the (application, server) lock is held;
    /// when it answers false nothing is written and `Ok(false)` comes back.
    async fn replace_all(
        &self,
        server: &Server,
        app_uuid: &str,
        files: &[ScenarioFile],
        is_current: StillCurrent<'_>,
    ) -> Result<bool>;

    /// Scenario file names currently present for the application
    async fn list(&self, server: &Server, app_uuid: &str) -> Result<Vec<String>>;
}

/// Staleness check evaluated under the upload lock
pub type StillCurrent<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// Lock table keyed by (application uuid, server)
#[derive(Default)]
pub struct UploadLocks {
    locks: DashMap<(String, ServerId), Arc<Mutex<()>>>,
}

impl UploadLocks {
    pub fn lock_for(&self, app_uuid: &str, server_id: ServerId) -> Arc<Mutex<()>> {
        self.locks
            .entry((app_uuid.to_string(), server_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// File name prefix owned by an application
pub fn owned_prefix(app_uuid: &str) -> String {
    format!("{}.", app_uuid)
}

pub struct RemoteScenarioStore<E: RemoteExecutor> {
    executor: Arc<E>,
    scenario_dir: String,
    locks: UploadLocks,
}

impl<E: RemoteExecutor> RemoteScenarioStore<E> {
    pub fn new(executor: Arc<E>, scenario_dir: impl Into<String>) -> Self {
        Self {
            executor,
            scenario_dir: scenario_dir.into().trim_end_matches('/').to_string(),
            locks: UploadLocks::default(),
        }
    }

    fn path(&self, file_name: &str) -> String {
        format!("{}/{}", self.scenario_dir, file_name)
    }

    /// Upload into `staging`, move into place and drop stale files.
    /// Returns how many stale files were removed.
    async fn activate(
        &self,
        server: &Server,
        staging: &str,
        existing: &[String],
        files: &[ScenarioFile],
    ) -> Result<usize> {
        for file in files {
            let staged = format!("{}/{}", staging, file.file_name);
            self.executor
                .upload(server, file.contents.as_bytes(), &staged)
                .await?;
        }

        let keep: BTreeSet<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        let mut commands: Vec<String> = files
            .iter()
            .map(|file| {
                format!(
                    "mv -f {} {}",
                    shell_quote(&format!("{}/{}", staging, file.file_name)),
                    shell_quote(&self.path(&file.file_name))
                )
            })
            .collect();
        let stale: Vec<&String> = existing
            .iter()
            .filter(|name| !keep.contains(name.as_str()))
            .collect();
        commands.extend(
            stale
                .iter()
                .map(|name| format!("rm -f {}", shell_quote(&self.path(name)))),
        );
        commands.push(format!("rm -rf {}", shell_quote(staging)));

        self.executor.exec(server, &commands).await?;
        Ok(stale.len())
    }

    async fn list_unlocked(&self, server: &Server, app_uuid: &str) -> Result<Vec<String>> {
        let command = format!("ls -1A {} 2>/dev/null || true", shell_quote(&self.scenario_dir));
        let output = self.executor.exec(server, &[command]).await?;
        let prefix = owned_prefix(app_uuid);
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".yaml"))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl<E: RemoteExecutor> ScenarioStore for RemoteScenarioStore<E> {
    #[instrument(skip(self, server, files, is_current), fields(server_id = server.id, files = files.len()))]
    async fn replace_all(
        &self,
        server: &Server,
        app_uuid: &str,
        files: &[ScenarioFile],
        is_current: StillCurrent<'_>,
    ) -> Result<bool> {
        let lock = self.locks.lock_for(app_uuid, server.id);
        let _guard = lock.lock().await;

        if !is_current() {
            debug!(app_uuid, "Newer scenario set pending, skipping replace");
            return Ok(false);
        }

        let existing = self.list_unlocked(server, app_uuid).await?;
        let staging = format!(
            "{}/.staging-{}-{}",
            self.scenario_dir,
            app_uuid,
            uuid::Uuid::new_v4().simple()
        );

        let stale = match self.activate(server, &staging, &existing, files).await {
            Ok(stale) => stale,
            Err(e) => {
                let cleanup = format!("rm -rf {}", shell_quote(&staging));
                if let Err(cleanup_err) = self.executor.exec(server, &[cleanup]).await {
                    warn!(staging = %staging, error = %cleanup_err, "Failed to remove staging directory");
                }
                return Err(e);
            }
        };

        counter!("bastion_scenarios_uploaded_total", files.len() as u64);
        info!(
            app_uuid,
            activated = files.len(),
            removed = stale,
            "Scenario set replaced"
        );
        Ok(true)
    }

    async fn list(&self, server: &Server, app_uuid: &str) -> Result<Vec<String>> {
        let lock = self.locks.lock_for(app_uuid, server.id);
        let _guard = lock.lock().await;
        self.list_unlocked(server, app_uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Simulates one server's scenario directory
    #[derive(Default)]
    struct DirExecutor {
        files: StdMutex<BTreeSet<String>>,
        staged: StdMutex<BTreeSet<String>>,
        scripts: StdMutex<Vec<Vec<String>>>,
        fail_uploads: bool,
    }

    #[async_trait]
    impl RemoteExecutor for DirExecutor {
        async fn exec(&self, _server: &Server, commands: &[String]) -> Result<String> {
            self.scripts.lock().unwrap().push(commands.to_vec());
            let mut files = self.files.lock().unwrap();
            let mut out = String::new();
            for command in commands {
                let parts: Vec<&str> = command.split_whitespace().collect();
                match parts.as_slice() {
                    ["ls", ..] => {
                        for f in files.iter() {
                            out.push_str(f);
                            out.push('\n');
                        }
                    }
                    ["mv", "-f", _, dst] => {
                        let name = dst.rsplit('/').next().unwrap_or_default();
                        files.insert(name.to_string());
                    }
                    ["rm", "-f", path] => {
                        let name = path.rsplit('/').next().unwrap_or_default();
                        files.remove(name);
                    }
                    _ => {}
                }
            }
            Ok(out)
        }

        async fn upload(&self, _server: &Server, _contents: &[u8], remote_path: &str) -> Result<()> {
            if self.fail_uploads {
                return Err(crate::error::SecurityError::Transport("scp: connection reset".to_string()));
            }
            self.staged.lock().unwrap().insert(remote_path.to_string());
            Ok(())
        }
    }

    fn file(name: &str) -> ScenarioFile {
        ScenarioFile {
            file_name: name.to_string(),
            contents: "type: leaky\n".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replace_removes_stale_files_of_same_app_only() {
        let executor = Arc::new(DirExecutor::default());
        executor.files.lock().unwrap().extend([
            "abc.old-1.yaml".to_string(),
            "abc-def.other-9.yaml".to_string(),
            "crowdsecurity-http.yaml".to_string(),
        ]);
        let store = RemoteScenarioStore::new(executor.clone(), "/data/scenarios/");
        let server = Server::new(1, "edge", "10.0.0.1");

        let written = store
            .replace_all(&server, "abc", &[file("abc.new-2.yaml"), file("abc.new-3.yaml")], &|| true)
            .await
            .unwrap();
        assert!(written);

        let files = executor.files.lock().unwrap().clone();
        assert!(files.contains("abc.new-2.yaml"));
        assert!(files.contains("abc.new-3.yaml"));
        assert!(!files.contains("abc.old-1.yaml"));
        assert!(files.contains("abc-def.other-9.yaml"));
        assert!(files.contains("crowdsecurity-http.yaml"));

        let staged = executor.staged.lock().unwrap();
        assert!(staged.iter().all(|p| p.starts_with("/data/scenarios/.staging-abc-")));
    }

    #[tokio::test]
    async fn test_failed_upload_removes_staging_dir() {
        let executor = Arc::new(DirExecutor {
            fail_uploads: true,
            ..Default::default()
        });
        executor.files.lock().unwrap().insert("abc.old-1.yaml".to_string());
        let store = RemoteScenarioStore::new(executor.clone(), "/data/scenarios");
        let server = Server::new(1, "edge", "10.0.0.1");

        let err = store
            .replace_all(&server, "abc", &[file("abc.new-2.yaml")], &|| true)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let scripts = executor.scripts.lock().unwrap();
        let cleanup = scripts.last().unwrap();
        assert_eq!(cleanup.len(), 1);
        assert!(cleanup[0].starts_with("rm -rf /data/scenarios/.staging-abc-"));
        assert!(executor.files.lock().unwrap().contains("abc.old-1.yaml"));
    }

    #[tokio::test]
    async fn test_superseded_replace_writes_nothing() {
        let executor = Arc::new(DirExecutor::default());
        executor.files.lock().unwrap().insert("abc.old-1.yaml".to_string());
        let store = RemoteScenarioStore::new(executor.clone(), "/data/scenarios");
        let server = Server::new(1, "edge", "10.0.0.1");

        let written = store
            .replace_all(&server, "abc", &[file("abc.new-2.yaml")], &|| false)
            .await
            .unwrap();

        assert!(!written);
        assert!(executor.scripts.lock().unwrap().is_empty());
        assert!(executor.staged.lock().unwrap().is_empty());
        assert!(executor.files.lock().unwrap().contains("abc.old-1.yaml"));
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let executor = Arc::new(DirExecutor::default());
        executor.files.lock().unwrap().extend([
            "abc.a-1.yaml".to_string(),
            "abcd.b-2.yaml".to_string(),
        ]);
        let store = RemoteScenarioStore::new(executor, "/data/scenarios");
        let server = Server::new(1, "edge", "10.0.0.1");

        assert_eq!(store.list(&server, "abc").await.unwrap(), vec!["abc.a-1.yaml"]);
    }

    #[tokio::test]
    async fn test_locks_are_per_app_and_server() {
        let locks = UploadLocks::default();
        let a = locks.lock_for("abc", 1);
        let b = locks.lock_for("abc", 1);
        let c = locks.lock_for("abc", 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock().await;
        assert!(c.try_lock().is_ok());
        assert!(b.try_lock().is_err());
    }
}
