//! Coordination Service
//!
//! A hierarchical key-value store with the coordination primitives the
//! replication layer needs: persistent, ephemeral and sequential nodes,
//! creation-order stamps (`czxid`), children listing, watches and
//! all-or-nothing multi-op transactions. Replicas talk to it through a
//! session-scoped [`Coordinator`] handle; expiring a session removes its
//! ephemeral nodes and fails every further call on that handle, which the
//! restarter observes through [`Coordinator::expired`].
//!
//! The service is in-process and shared via `Arc`. The handle surface is
//! deliberately that of a networked ensemble client so one could be
//! swapped in without touching the replication layer.

pub mod election;
pub mod lock;
pub mod paths;

pub use election::{EphemeralNodeHolder, LeaderElection};
pub use lock::{AbandonableLock, LockState};
pub use paths::{ReplicaPaths, TablePaths};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Identifier of one coordinator session.
pub type SessionId = u64;

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Transaction id that created the node; totally ordered across the
    /// whole service.
    pub czxid: i64,
    pub num_children: usize,
}

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// One operation of a multi-op transaction.
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        value: String,
        mode: CreateMode,
    },
    Set {
        path: String,
        value: String,
    },
    Remove {
        path: String,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, value: impl Into<String>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            value: value.into(),
            mode,
        }
    }

    pub fn set(path: impl Into<String>, value: impl Into<String>) -> Self {
        Op::Set {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove { path: path.into() }
    }
}

/// Result of one applied multi operation.
#[derive(Debug, Clone)]
pub enum OpResult {
    /// Full path of the created node (resolved for sequential creates).
    Created(String),
    Set,
    Removed,
}

/// A registered watch; fires once on the next change of the watched path
/// or of its direct children.
pub struct Watch {
    notify: Arc<Notify>,
}

impl Watch {
    /// Wait for the watch to fire, up to `timeout`. Returns whether it
    /// fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone)]
struct Node {
    value: String,
    czxid: i64,
    ephemeral_owner: Option<SessionId>,
    next_seq: u64,
    children: BTreeSet<String>,
}

impl Node {
    fn new(value: String, czxid: i64, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            value,
            czxid,
            ephemeral_owner,
            next_seq: 0,
            children: BTreeSet::new(),
        }
    }
}

struct ServiceState {
    nodes: HashMap<String, Node>,
    next_zxid: i64,
    next_session: SessionId,
    live_sessions: HashSet<SessionId>,
    watches: HashMap<String, Vec<Arc<Notify>>>,
}

/// The in-process coordination service shared by all replicas of a
/// deployment.
pub struct CoordinatorService {
    state: Mutex<ServiceState>,
}

impl CoordinatorService {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(String::new(), 0, None));
        Arc::new(Self {
            state: Mutex::new(ServiceState {
                nodes,
                next_zxid: 1,
                next_session: 1,
                live_sessions: HashSet::new(),
                watches: HashMap::new(),
            }),
        })
    }

    /// Open a new session.
    pub fn connect(self: &Arc<Self>) -> Coordinator {
        let mut state = self.state.lock().unwrap();
        let session = state.next_session;
        state.next_session += 1;
        state.live_sessions.insert(session);
        Coordinator {
            service: Arc::clone(self),
            session,
        }
    }

    /// Expire a session: every handle carrying it starts failing with
    /// `SessionExpired` and its ephemeral nodes are removed.
    pub fn expire_session(&self, session: SessionId) {
        let fired = {
            let mut state = self.state.lock().unwrap();
            if !state.live_sessions.remove(&session) {
                return;
            }

            let mut ephemerals: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            // Deepest first, in case an ephemeral has ephemeral children.
            ephemerals.sort_by_key(|path| std::cmp::Reverse(path.len()));

            let mut fired = Vec::new();
            for path in ephemerals {
                remove_node(&mut state.nodes, &path);
                collect_watches(&mut state.watches, &path, &mut fired);
            }
            fired
        };
        fire(fired);
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn child_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(Error::Coordinator(format!("invalid path: {path}")));
    }
    Ok(())
}

fn remove_node(nodes: &mut HashMap<String, Node>, path: &str) {
    nodes.remove(path);
    let (parent, name) = (parent_of(path).to_string(), child_name(path).to_string());
    if let Some(parent_node) = nodes.get_mut(&parent) {
        parent_node.children.remove(&name);
    }
}

fn collect_watches(
    watches: &mut HashMap<String, Vec<Arc<Notify>>>,
    path: &str,
    fired: &mut Vec<Arc<Notify>>,
) {
    for key in [path, parent_of(path)] {
        if let Some(list) = watches.remove(key) {
            fired.extend(list);
        }
    }
}

fn fire(notifies: Vec<Arc<Notify>>) {
    for notify in notifies {
        notify.notify_one();
    }
}

fn apply_create(
    nodes: &mut HashMap<String, Node>,
    next_zxid: &mut i64,
    session: SessionId,
    path: &str,
    value: &str,
    mode: CreateMode,
) -> Result<String> {
    validate_path(path)?;
    let (parent, full_path) = if mode.is_sequential() {
        let parent = parent_of(path).to_string();
        let prefix = child_name(path).to_string();
        let parent_node = nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;
        let seq = parent_node.next_seq;
        parent_node.next_seq += 1;
        (parent.clone(), join(&parent, &format!("{prefix}{seq:010}")))
    } else {
        let parent = parent_of(path).to_string();
        if !nodes.contains_key(&parent) {
            return Err(Error::NoNode(parent));
        }
        if nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        (parent, path.to_string())
    };

    let czxid = *next_zxid;
    *next_zxid += 1;
    let owner = mode.is_ephemeral().then_some(session);
    nodes.insert(full_path.clone(), Node::new(value.to_string(), czxid, owner));
    let name = child_name(&full_path).to_string();
    nodes.get_mut(&parent).unwrap().children.insert(name);
    Ok(full_path)
}

fn apply_set(nodes: &mut HashMap<String, Node>, path: &str, value: &str) -> Result<()> {
    let node = nodes
        .get_mut(path)
        .ok_or_else(|| Error::NoNode(path.to_string()))?;
    node.value = value.to_string();
    Ok(())
}

fn apply_remove(nodes: &mut HashMap<String, Node>, path: &str) -> Result<()> {
    let node = nodes
        .get(path)
        .ok_or_else(|| Error::NoNode(path.to_string()))?;
    if !node.children.is_empty() {
        return Err(Error::Coordinator(format!("node {path} has children")));
    }
    remove_node(nodes, path);
    Ok(())
}

/// Session-scoped handle to the coordination service.
#[derive(Clone)]
pub struct Coordinator {
    service: Arc<CoordinatorService>,
    session: SessionId,
}

impl Coordinator {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Whether this handle's session has expired.
    pub fn expired(&self) -> bool {
        !self
            .service
            .state
            .lock()
            .unwrap()
            .live_sessions
            .contains(&self.session)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ServiceState) -> Result<T>) -> Result<T> {
        let mut state = self.service.state.lock().unwrap();
        if !state.live_sessions.contains(&self.session) {
            return Err(Error::SessionExpired);
        }
        f(&mut state)
    }

    /// Create a node; returns its full path (resolved for sequential
    /// modes).
    pub fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String> {
        let (created, fired) = self.with_state(|state| {
            let ServiceState {
                nodes,
                next_zxid,
                watches,
                ..
            } = state;
            let created = apply_create(nodes, next_zxid, self.session, path, value, mode)?;
            let mut fired = Vec::new();
            collect_watches(watches, &created, &mut fired);
            Ok((created, fired))
        })?;
        fire(fired);
        Ok(created)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.with_state(|state| Ok(state.nodes.contains_key(path)))
    }

    pub fn exists_stat(&self, path: &str) -> Result<Option<Stat>> {
        self.with_state(|state| {
            Ok(state.nodes.get(path).map(|node| Stat {
                czxid: node.czxid,
                num_children: node.children.len(),
            }))
        })
    }

    /// Existence check that also registers a watch on the path; the watch
    /// fires on the next change of the path or of its direct children.
    pub fn exists_watch(&self, path: &str) -> Result<(bool, Watch)> {
        self.with_state(|state| {
            let exists = state.nodes.contains_key(path);
            let notify = Arc::new(Notify::new());
            state
                .watches
                .entry(path.to_string())
                .or_default()
                .push(Arc::clone(&notify));
            Ok((exists, Watch { notify }))
        })
    }

    pub fn get(&self, path: &str) -> Result<String> {
        self.try_get(path)?
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    pub fn try_get(&self, path: &str) -> Result<Option<String>> {
        self.with_state(|state| Ok(state.nodes.get(path).map(|node| node.value.clone())))
    }

    pub fn try_get_stat(&self, path: &str) -> Result<Option<(String, Stat)>> {
        self.with_state(|state| {
            Ok(state.nodes.get(path).map(|node| {
                (
                    node.value.clone(),
                    Stat {
                        czxid: node.czxid,
                        num_children: node.children.len(),
                    },
                )
            }))
        })
    }

    pub fn set(&self, path: &str, value: &str) -> Result<()> {
        let fired = self.with_state(|state| {
            let ServiceState { nodes, watches, .. } = state;
            apply_set(nodes, path, value)?;
            let mut fired = Vec::new();
            collect_watches(watches, path, &mut fired);
            Ok(fired)
        })?;
        fire(fired);
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let fired = self.with_state(|state| {
            let ServiceState { nodes, watches, .. } = state;
            apply_remove(nodes, path)?;
            let mut fired = Vec::new();
            collect_watches(watches, path, &mut fired);
            Ok(fired)
        })?;
        fire(fired);
        Ok(())
    }

    /// Remove that tolerates the node being absent; returns whether a
    /// node was removed.
    pub fn try_remove(&self, path: &str) -> Result<bool> {
        match self.remove(path) {
            Ok(()) => Ok(true),
            Err(Error::NoNode(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove a whole subtree, deepest nodes first.
    pub fn remove_recursive(&self, path: &str) -> Result<()> {
        let fired = self.with_state(|state| {
            let prefix = format!("{path}/");
            let mut subtree: Vec<String> = state
                .nodes
                .keys()
                .filter(|p| *p == path || p.starts_with(&prefix))
                .cloned()
                .collect();
            subtree.sort_by_key(|p| std::cmp::Reverse(p.len()));

            let ServiceState { nodes, watches, .. } = state;
            let mut fired = Vec::new();
            for p in subtree {
                remove_node(nodes, &p);
                collect_watches(watches, &p, &mut fired);
            }
            Ok(fired)
        })?;
        fire(fired);
        Ok(())
    }

    /// Sorted child names of a node.
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        self.with_state(|state| {
            let node = state
                .nodes
                .get(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            Ok(node.children.iter().cloned().collect())
        })
    }

    /// Apply several operations atomically: either all succeed or none is
    /// applied.
    pub fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>> {
        let (results, fired) = self.with_state(|state| {
            let mut staged = state.nodes.clone();
            let mut staged_zxid = state.next_zxid;
            let mut results = Vec::with_capacity(ops.len());
            let mut touched = Vec::new();

            for op in &ops {
                match op {
                    Op::Create { path, value, mode } => {
                        let created = apply_create(
                            &mut staged,
                            &mut staged_zxid,
                            self.session,
                            path,
                            value,
                            *mode,
                        )?;
                        touched.push(created.clone());
                        results.push(OpResult::Created(created));
                    }
                    Op::Set { path, value } => {
                        apply_set(&mut staged, path, value)?;
                        touched.push(path.clone());
                        results.push(OpResult::Set);
                    }
                    Op::Remove { path } => {
                        apply_remove(&mut staged, path)?;
                        touched.push(path.clone());
                        results.push(OpResult::Removed);
                    }
                }
            }

            state.nodes = staged;
            state.next_zxid = staged_zxid;
            let mut fired = Vec::new();
            for path in touched {
                collect_watches(&mut state.watches, &path, &mut fired);
            }
            Ok((results, fired))
        })?;
        fire(fired);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistent(coordinator: &Coordinator, path: &str, value: &str) {
        coordinator
            .create(path, value, CreateMode::Persistent)
            .unwrap();
    }

    #[test]
    fn test_create_get_children() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();

        persistent(&coordinator, "/t", "");
        persistent(&coordinator, "/t/b", "beta");
        persistent(&coordinator, "/t/a", "alpha");

        assert_eq!(coordinator.get("/t/a").unwrap(), "alpha");
        assert_eq!(coordinator.children("/t").unwrap(), vec!["a", "b"]);
        assert!(matches!(
            coordinator.get("/t/c"),
            Err(Error::NoNode(_))
        ));
        assert!(matches!(
            coordinator.create("/t/a", "", CreateMode::Persistent),
            Err(Error::NodeExists(_))
        ));
        assert!(matches!(
            coordinator.create("/missing/a", "", CreateMode::Persistent),
            Err(Error::NoNode(_))
        ));
    }

    #[test]
    fn test_sequential_names_are_zero_padded_and_increasing() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        persistent(&coordinator, "/t", "");

        let first = coordinator
            .create("/t/log-", "a", CreateMode::PersistentSequential)
            .unwrap();
        let second = coordinator
            .create("/t/log-", "b", CreateMode::PersistentSequential)
            .unwrap();

        assert_eq!(first, "/t/log-0000000000");
        assert_eq!(second, "/t/log-0000000001");

        let first_stat = coordinator.exists_stat(&first).unwrap().unwrap();
        let second_stat = coordinator.exists_stat(&second).unwrap().unwrap();
        assert!(first_stat.czxid < second_stat.czxid);
    }

    #[test]
    fn test_multi_is_atomic() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        persistent(&coordinator, "/t", "");

        // Second op fails: nothing from the batch must be applied.
        let result = coordinator.multi(vec![
            Op::create("/t/a", "", CreateMode::Persistent),
            Op::set("/t/missing", "x"),
        ]);
        assert!(result.is_err());
        assert!(!coordinator.exists("/t/a").unwrap());

        let results = coordinator
            .multi(vec![
                Op::create("/t/q-", "payload", CreateMode::PersistentSequential),
                Op::set("/t", "pointer"),
            ])
            .unwrap();
        match &results[0] {
            OpResult::Created(path) => assert_eq!(path, "/t/q-0000000000"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(coordinator.get("/t").unwrap(), "pointer");
    }

    #[test]
    fn test_multi_remove_child_then_parent() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        persistent(&coordinator, "/t", "");
        persistent(&coordinator, "/t/p", "");
        persistent(&coordinator, "/t/p/c", "");

        coordinator
            .multi(vec![Op::remove("/t/p/c"), Op::remove("/t/p")])
            .unwrap();
        assert!(!coordinator.exists("/t/p").unwrap());
    }

    #[test]
    fn test_session_expiry_removes_ephemerals_and_fails_handle() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        persistent(&coordinator, "/t", "");
        coordinator
            .create("/t/is_active", "id", CreateMode::Ephemeral)
            .unwrap();

        let other = service.connect();
        service.expire_session(coordinator.session_id());

        assert!(coordinator.expired());
        assert!(matches!(coordinator.get("/t"), Err(Error::SessionExpired)));
        assert!(!other.exists("/t/is_active").unwrap());
    }

    #[tokio::test]
    async fn test_watch_fires_on_child_change() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        persistent(&coordinator, "/t", "");

        let (exists, watch) = coordinator.exists_watch("/t").unwrap();
        assert!(exists);

        persistent(&coordinator, "/t/child", "");
        assert!(watch.wait_timeout(Duration::from_secs(1)).await);

        // One-shot: a new child change needs a new watch.
        let (_, watch) = coordinator.exists_watch("/t").unwrap();
        assert!(!watch.wait_timeout(Duration::from_millis(50)).await);
    }
}
