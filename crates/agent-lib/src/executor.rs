//! Resource update executor
//!
//! All cgroup writes go through a single worker task fed by a bounded queue.
//! Updates are applied one at a time in submission order, so two updates to
//! the same file never interleave. Each update is a read-modify-write: the
//! worker reads the current value, computes the desired one and only writes
//! when they differ.

use crate::cgroup::CgroupFs;
use crate::cpu_list::CpuSet;
use crate::observability::AgentMetrics;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Computes the desired file content from the current (trimmed) content
pub type ComputeFn = Box<dyn FnOnce(&str) -> String + Send>;

/// Decides whether the current and desired content already agree
pub type SameFn = fn(&str, &str) -> bool;

fn same_text(current: &str, desired: &str) -> bool {
    current == desired
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("resource executor is stopped")]
    Stopped,

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("update of {0} was dropped before it was applied")]
    Dropped(PathBuf),
}

/// Result of an applied update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    Unchanged,
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, UpdateOutcome::Written)
    }
}

/// Counters returned by the worker when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub written: u64,
    pub unchanged: u64,
    pub failed: u64,
}

struct UpdateRequest {
    path: PathBuf,
    compute: ComputeFn,
    same: SameFn,
    reply: oneshot::Sender<Result<UpdateOutcome, ExecutorError>>,
}

/// Handle to a queued update
#[derive(Debug)]
pub struct UpdateTicket {
    path: PathBuf,
    rx: oneshot::Receiver<Result<UpdateOutcome, ExecutorError>>,
}

impl UpdateTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until the worker has applied the update
    pub async fn wait(self) -> Result<UpdateOutcome, ExecutorError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Dropped(self.path)),
        }
    }
}

/// Clonable handle for submitting cgroup updates
#[derive(Clone)]
pub struct ResourceUpdateExecutor {
    tx: mpsc::Sender<UpdateRequest>,
}

impl ResourceUpdateExecutor {
    /// Create an executor and the worker that must be spawned to serve it
    pub fn new(fs: Arc<dyn CgroupFs>, queue_size: usize) -> (Self, ExecutorWorker) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));

        let worker = ExecutorWorker {
            fs,
            rx,
            metrics: AgentMetrics::new(),
            stats: ExecutorStats::default(),
        };

        (Self { tx }, worker)
    }

    /// Queue an update. Waits only while the queue is full.
    pub async fn submit<F>(
        &self,
        path: impl Into<PathBuf>,
        compute: F,
    ) -> Result<UpdateTicket, ExecutorError>
    where
        F: FnOnce(&str) -> String + Send + 'static,
    {
        self.enqueue(path.into(), Box::new(compute), same_text).await
    }

    async fn enqueue(
        &self,
        path: PathBuf,
        compute: ComputeFn,
        same: SameFn,
    ) -> Result<UpdateTicket, ExecutorError> {
        let (reply, rx) = oneshot::channel();
        let request = UpdateRequest {
            path: path.clone(),
            compute,
            same,
            reply,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| ExecutorError::Stopped)?;

        Ok(UpdateTicket { path, rx })
    }

    /// Queue an update and wait for its result
    pub async fn update<F>(
        &self,
        path: impl Into<PathBuf>,
        compute: F,
    ) -> Result<UpdateOutcome, ExecutorError>
    where
        F: FnOnce(&str) -> String + Send + 'static,
    {
        self.submit(path, compute).await?.wait().await
    }

    /// Queue a write of a fixed value
    pub async fn submit_value(
        &self,
        path: impl Into<PathBuf>,
        value: impl Into<String>,
    ) -> Result<UpdateTicket, ExecutorError> {
        let value = value.into();
        self.submit(path, move |_| value).await
    }

    /// Queue a write of a cpu list. Lists naming the same CPUs in a
    /// different form (`0-7,8-15` against `0-15`) count as unchanged.
    pub async fn submit_cpuset(
        &self,
        path: impl Into<PathBuf>,
        value: impl Into<String>,
    ) -> Result<UpdateTicket, ExecutorError> {
        let value = value.into();
        self.enqueue(path.into(), Box::new(move |_| value), CpuSet::same_list)
            .await
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The task that applies queued updates
pub struct ExecutorWorker {
    fs: Arc<dyn CgroupFs>,
    rx: mpsc::Receiver<UpdateRequest>,
    metrics: AgentMetrics,
    stats: ExecutorStats,
}

impl ExecutorWorker {
    /// Apply updates until shutdown, then drain what is already queued
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ExecutorStats {
        info!("Starting resource update executor");

        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(request) => self.handle(request).await,
                        None => {
                            debug!("All executor handles dropped");
                            return self.stats;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        // Refuse new submits, then apply whatever is queued
        self.rx.close();
        let mut drained = 0usize;
        while let Some(request) = self.rx.recv().await {
            self.handle(request).await;
            drained += 1;
        }

        info!(
            drained = drained,
            written = self.stats.written,
            unchanged = self.stats.unchanged,
            failed = self.stats.failed,
            "Resource update executor stopped"
        );
        self.stats
    }

    async fn handle(&mut self, request: UpdateRequest) {
        let UpdateRequest {
            path,
            compute,
            same,
            reply,
        } = request;

        let result = self.apply(&path, compute, same).await;
        match &result {
            Ok(UpdateOutcome::Written) => {
                self.stats.written += 1;
                self.metrics.inc_cgroup_update("written");
            }
            Ok(UpdateOutcome::Unchanged) => {
                self.stats.unchanged += 1;
                self.metrics.inc_cgroup_update("unchanged");
            }
            Err(e) => {
                self.stats.failed += 1;
                self.metrics.inc_cgroup_update("failed");
                warn!(path = %path.display(), error = %e, "Cgroup update failed");
            }
        }

        // Submitter may have stopped waiting
        let _ = reply.send(result);
    }

    async fn apply(
        &self,
        path: &Path,
        compute: ComputeFn,
        same: SameFn,
    ) -> Result<UpdateOutcome, ExecutorError> {
        let current = self
            .fs
            .read(path)
            .await
            .map_err(|source| ExecutorError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let current = current.trim();

        let desired = compute(current);
        if same(current, &desired) {
            return Ok(UpdateOutcome::Unchanged);
        }

        self.fs
            .write(path, &desired)
            .await
            .map_err(|source| ExecutorError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(path = %path.display(), old = %current, new = %desired, "Cgroup file updated");
        Ok(UpdateOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::HostCgroupFs;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::fs;

    /// In-memory files that record every write
    #[derive(Default)]
    struct RecordingFs {
        files: Mutex<HashMap<PathBuf, String>>,
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CgroupFs for RecordingFs {
        async fn read(&self, path: &Path) -> io::Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
            // Yield so concurrent submitters get a chance to interleave
            tokio::task::yield_now().await;
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), content.to_string());
            self.writes.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

    fn spawn_worker(
        fs: Arc<dyn CgroupFs>,
        queue_size: usize,
    ) -> (
        ResourceUpdateExecutor,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<ExecutorStats>,
    ) {
        let (executor, worker) = ResourceUpdateExecutor::new(fs, queue_size);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        (executor, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_updates_applied_in_submission_order() {
        let fs = Arc::new(RecordingFs::default());
        let path = PathBuf::from("/cg/cpuset.cpus");
        fs.files.lock().unwrap().insert(path.clone(), String::new());

        let (executor, shutdown_tx, handle) = spawn_worker(fs.clone(), 4);

        let mut tickets = Vec::new();
        for i in 0..10 {
            tickets.push(executor.submit_value(&path, i.to_string()).await.unwrap());
        }
        for ticket in tickets {
            assert_eq!(ticket.wait().await.unwrap(), UpdateOutcome::Written);
        }

        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*fs.writes.lock().unwrap(), expected);

        shutdown_tx.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.written, 10);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let fs = Arc::new(RecordingFs::default());
        let path = PathBuf::from("/cg/counter");
        fs.files.lock().unwrap().insert(path.clone(), "0".to_string());

        let (executor, shutdown_tx, handle) = spawn_worker(fs.clone(), 8);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let executor = executor.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                executor
                    .update(path, |current| {
                        let n: u64 = current.parse().unwrap_or(0);
                        (n + 1).to_string()
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fs.files.lock().unwrap()[&path], "50");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_value_is_not_written() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpuset.cpus");
        fs::write(&path, "0-3\n").await.unwrap();

        let (executor, shutdown_tx, handle) = spawn_worker(Arc::new(HostCgroupFs), 4);

        let outcome = executor
            .update(&path, |_| "0-3".to_string())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "0-3\n");

        let outcome = executor.update(&path, |_| "4-7".to_string()).await.unwrap();
        assert!(outcome.changed());
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "4-7");

        shutdown_tx.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(
            stats,
            ExecutorStats {
                written: 1,
                unchanged: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_equivalent_cpu_list_is_not_rewritten() {
        let fs = Arc::new(RecordingFs::default());
        let path = PathBuf::from("/cg/cpuset.cpus");
        // The kernel reports the canonical form back
        fs.files.lock().unwrap().insert(path.clone(), "0-15\n".to_string());

        let (executor, shutdown_tx, handle) = spawn_worker(fs.clone(), 4);

        let outcome = executor
            .submit_cpuset(&path, "0-7,8-15")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);

        let outcome = executor
            .submit_cpuset(&path, "0-7")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Written);
        assert_eq!(*fs.writes.lock().unwrap(), vec!["0-7".to_string()]);

        shutdown_tx.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails_alone() {
        let temp_dir = TempDir::new().unwrap();
        let good = temp_dir.path().join("cpuset.cpus");
        fs::write(&good, "").await.unwrap();
        let missing = temp_dir.path().join("gone").join("cpuset.cpus");

        let (executor, shutdown_tx, handle) = spawn_worker(Arc::new(HostCgroupFs), 4);

        let bad_ticket = executor.submit_value(&missing, "0-3").await.unwrap();
        let good_ticket = executor.submit_value(&good, "0-3").await.unwrap();

        assert!(matches!(
            bad_ticket.wait().await,
            Err(ExecutorError::Read { .. })
        ));
        assert_eq!(good_ticket.wait().await.unwrap(), UpdateOutcome::Written);
        assert!(fs::metadata(&missing).await.is_err());

        shutdown_tx.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_stopped() {
        let fs = Arc::new(RecordingFs::default());
        let (executor, shutdown_tx, handle) = spawn_worker(fs, 4);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(executor.is_stopped());
        assert!(matches!(
            executor.submit_value("/cg/cpuset.cpus", "0").await,
            Err(ExecutorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_queued_updates_drain_on_shutdown() {
        let fs = Arc::new(RecordingFs::default());
        for i in 0..5 {
            fs.files
                .lock()
                .unwrap()
                .insert(PathBuf::from(format!("/cg/{i}")), String::new());
        }

        let (executor, worker) = ResourceUpdateExecutor::new(fs.clone(), 8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut tickets = Vec::new();
        for i in 0..5 {
            tickets.push(
                executor
                    .submit_value(format!("/cg/{i}"), "1")
                    .await
                    .unwrap(),
            );
        }

        // Shutdown is already pending when the worker starts
        shutdown_tx.send(()).unwrap();
        let stats = worker.run(shutdown_rx).await;

        assert_eq!(stats.written, 5);
        for ticket in tickets {
            assert_eq!(ticket.wait().await.unwrap(), UpdateOutcome::Written);
        }
    }
}
