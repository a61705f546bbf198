//! Leader-gated task runner.
//!
//! Each task periodically elects (or only looks up) the leader of a resource
//! and runs shell commands depending on whether this node leads. Follower
//! commands get the leader id as their last argument.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::election::LeaderElection;
use crate::error::ElectionError;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderTask {
    pub resource: String,
    /// Take part in the election; otherwise only read the leader.
    #[serde(default)]
    pub elect: bool,
    /// Lease TTL, the facade default when absent.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub leader_commands: Vec<String>,
    #[serde(default)]
    pub follower_commands: Vec<String>,
}

fn default_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<LeaderTask>,
}

pub fn load_tasks(path: &Path) -> Result<Vec<LeaderTask>, ElectionError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ElectionError::Config(format!("Failed to read task file {}: {}", path.display(), e)))?;
    let file: TaskFile = serde_yaml::from_str(&content)?;
    for task in &file.tasks {
        if task.resource.is_empty() {
            return Err(ElectionError::config("task resource must not be empty"));
        }
        if task.interval_ms == 0 {
            return Err(ElectionError::config(format!("task {} has a zero interval", task.resource)));
        }
    }
    Ok(file.tasks)
}

/// What one pass over a task found out.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRole {
    Leader,
    Follower(String),
    NoLeader,
    Unknown,
}

pub struct TaskRunner {
    election: Arc<LeaderElection>,
    node_id: String,
    tasks: Vec<(LeaderTask, Instant)>,
}

impl TaskRunner {
    pub fn new(election: Arc<LeaderElection>, node_id: impl Into<String>, tasks: Vec<LeaderTask>) -> Self {
        let now = Instant::now();
        Self {
            election,
            node_id: node_id.into(),
            tasks: tasks.into_iter().map(|task| (task, now)).collect(),
        }
    }

    /// Process due tasks every second until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Running {} leader tasks as {}", self.tasks.len(), self.node_id);
        tokio::pin!(shutdown);
        let mut ticker = time::interval(TICK);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.run_due().await,
            }
        }
        info!("Leader task runner stopped");
    }

    pub async fn run_due(&mut self) {
        let now = Instant::now();
        for i in 0..self.tasks.len() {
            if self.tasks[i].1 > now {
                continue;
            }
            let task = self.tasks[i].0.clone();
            self.tasks[i].1 = now + Duration::from_millis(task.interval_ms);
            self.process(&task).await;
        }
    }

    /// Resolve the leader for `task` and run the matching commands.
    pub async fn process(&self, task: &LeaderTask) -> TaskRole {
        let leader = if task.elect {
            let ttl = task
                .ttl_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.election.default_ttl());
            self.election
                .elect(&task.resource, &self.node_id, ttl)
                .await
                .map(Some)
        } else {
            self.election.get_leader(&task.resource).await
        };

        let role = match leader {
            Ok(Some(leader)) if leader == self.node_id => TaskRole::Leader,
            Ok(Some(leader)) => TaskRole::Follower(leader),
            Ok(None) => TaskRole::NoLeader,
            Err(e) => {
                warn!("Failed to resolve leader of {}: {}", task.resource, e);
                TaskRole::Unknown
            }
        };

        match &role {
            TaskRole::Leader => {
                for command in &task.leader_commands {
                    run_command(command, None).await;
                }
            }
            TaskRole::Follower(leader) => {
                for command in &task.follower_commands {
                    run_command(command, Some(leader)).await;
                }
            }
            TaskRole::NoLeader | TaskRole::Unknown => {
                debug!("No commands to run for {}", task.resource);
            }
        }
        role
    }
}

/// Run `command` through `sh -c`; `arg` is passed as `$1` and appended.
/// Failures are logged and never stop the runner.
pub async fn run_command(command: &str, arg: Option<&str>) -> bool {
    let mut cmd = Command::new("sh");
    match arg {
        Some(arg) => cmd.arg("-c").arg(format!("{} \"$1\"", command)).arg("sh").arg(arg),
        None => cmd.arg("-c").arg(command),
    };

    match cmd.status().await {
        Ok(status) if status.success() => {
            debug!("Command '{}' succeeded", command);
            true
        }
        Ok(status) => {
            warn!("Command '{}' exited with {}", command, status);
            false
        }
        Err(e) => {
            error!("Failed to run '{}': {}", command, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::store::{LeaseStore, MemoryLeaseStore};
    use std::io::Write;

    fn election(stores: &[Arc<MemoryLeaseStore>]) -> Arc<LeaderElection> {
        let handles = stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn LeaseStore>)
            .collect();
        Arc::new(LeaderElection::with_stores(handles, &ElectionConfig::default()).unwrap())
    }

    fn task(dir: &Path, elect: bool) -> LeaderTask {
        LeaderTask {
            resource: "svc".to_string(),
            elect,
            ttl_ms: Some(5_000),
            interval_ms: 1_000,
            leader_commands: vec![format!("touch {}", dir.join("leader").display())],
            follower_commands: vec![format!("printf %s > {}", dir.join("follower").display())],
        }
    }

    #[tokio::test]
    async fn test_leader_runs_leader_commands() {
        let dir = tempfile::tempdir().unwrap();
        let stores = vec![Arc::new(MemoryLeaseStore::new("a"))];
        let runner = TaskRunner::new(election(&stores), "node-1", vec![]);

        assert_eq!(runner.process(&task(dir.path(), true)).await, TaskRole::Leader);
        assert!(dir.path().join("leader").exists());
        assert!(!dir.path().join("follower").exists());
    }

    #[tokio::test]
    async fn test_follower_gets_leader_id() {
        let dir = tempfile::tempdir().unwrap();
        let stores = vec![Arc::new(MemoryLeaseStore::new("a"))];
        stores[0].seed("svc", "node-0", Duration::from_secs(30));
        let runner = TaskRunner::new(election(&stores), "node-1", vec![]);

        assert_eq!(
            runner.process(&task(dir.path(), false)).await,
            TaskRole::Follower("node-0".to_string())
        );
        let written = std::fs::read_to_string(dir.path().join("follower")).unwrap();
        assert_eq!(written, "node-0");
    }

    #[tokio::test]
    async fn test_unreachable_stores_run_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stores = vec![Arc::new(MemoryLeaseStore::new("a"))];
        stores[0].set_available(false);
        let runner = TaskRunner::new(election(&stores), "node-1", vec![]);

        assert_eq!(runner.process(&task(dir.path(), true)).await, TaskRole::Unknown);
        assert!(!dir.path().join("leader").exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_reported() {
        assert!(run_command("true", None).await);
        assert!(!run_command("exit 3", None).await);
    }

    #[test]
    fn test_load_tasks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "tasks:\n  - resource: svc\n    elect: true\n    leader_commands: [\"echo lead\"]\n  - resource: other\n"
        )
        .unwrap();

        let tasks = load_tasks(file.path()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].elect);
        assert_eq!(tasks[1].interval_ms, 10_000);
        assert!(!tasks[1].elect);
    }
}
