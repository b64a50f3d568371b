//! Leader Election
//!
//! Replicas compete by creating ephemeral sequential children of the
//! table's `leader_election/` node; the replica owning the smallest child
//! is the leader. Followers watch for membership changes and re-check.
//! Leadership is only lost with the session, so the callback fires at
//! most once per election handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::coordinator::{Coordinator, CreateMode};
use crate::error::Result;

const ELECTION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Scoped owner of an ephemeral node; removes it on release or drop.
pub struct EphemeralNodeHolder {
    coordinator: Coordinator,
    path: String,
    released: bool,
}

impl EphemeralNodeHolder {
    /// Take ownership of an already-created ephemeral node.
    pub fn existing(coordinator: Coordinator, path: impl Into<String>) -> Self {
        Self {
            coordinator,
            path: path.into(),
            released: false,
        }
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(err) = self.coordinator.try_remove(&self.path) {
                debug!(path = %self.path, error = %err, "failed to remove ephemeral node");
            }
        }
    }
}

impl Drop for EphemeralNodeHolder {
    fn drop(&mut self) {
        self.remove();
    }
}

/// A participant in the leader election.
pub struct LeaderElection {
    coordinator: Coordinator,
    node_path: String,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LeaderElection {
    /// Join the election. `on_leader` is invoked (once) from a background
    /// task when this participant owns the smallest election node.
    pub fn start(
        coordinator: Coordinator,
        election_path: &str,
        identity: &str,
        on_leader: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Self> {
        let node_path = coordinator.create(
            &format!("{election_path}/leader_election-"),
            identity,
            CreateMode::EphemeralSequential,
        )?;
        let my_name = node_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(watch_election(
            coordinator.clone(),
            election_path.to_string(),
            my_name,
            Arc::clone(&stop),
            on_leader,
        ));

        Ok(Self {
            coordinator,
            node_path,
            stop,
            task: Some(task),
        })
    }

    /// Leave the election: stop watching and remove the election node.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Err(err) = self.coordinator.try_remove(&self.node_path) {
            debug!(path = %self.node_path, error = %err, "failed to remove election node");
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn watch_election(
    coordinator: Coordinator,
    election_path: String,
    my_name: String,
    stop: Arc<AtomicBool>,
    on_leader: Box<dyn Fn() + Send + Sync>,
) {
    while !stop.load(Ordering::SeqCst) {
        let children = match coordinator.children(&election_path) {
            Ok(children) => children,
            Err(err) => {
                debug!(error = %err, "leader election check failed");
                return;
            }
        };

        if children.first() == Some(&my_name) {
            on_leader();
            return;
        }

        let watch = match coordinator.exists_watch(&election_path) {
            Ok((_, watch)) => watch,
            Err(err) => {
                debug!(error = %err, "leader election watch failed");
                return;
            }
        };
        watch.wait_timeout(ELECTION_CHECK_INTERVAL).await;
    }
}
