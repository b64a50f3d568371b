//! Replicated Table Engine
//!
//! Ties the local part store, the replication queue and the coordination
//! service together into one table replica: bootstrap against the shared
//! table subtree, background log pulling and queue execution, leader
//! election, housekeeping and session-expiry recovery.
//!
//! Thread model: long-lived loops (`restarting`, `queue_updating` and the
//! leader-only `merge_selecting` / `clear_old_blocks`) are tokio tasks
//! observing atomic shutdown flags at every iteration head; their join
//! handles are kept in the table state and awaited during partial
//! shutdown. Queue draining itself runs on the background pool, where
//! several workers may execute entries concurrently.

mod bootstrap;
mod executor;
mod housekeeper;
mod merge_selector;
pub mod metadata;
#[cfg(test)]
mod tests;
mod writer;

pub use writer::WriteOutcome;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::config::{ReplicationSettings, TableSchema, WolfTableConfig};
use crate::coordinator::{
    Coordinator, CoordinatorService, CreateMode, EphemeralNodeHolder, LeaderElection, Op,
    ReplicaPaths, TablePaths,
};
use crate::error::{Error, Result};
use crate::exchange::{self, EndpointHolder, ExchangeHandler, PartSupplier};
use crate::part::PartStore;
use crate::pool::{BackgroundPool, TaskHandle};
use crate::replication::ReplicationQueue;

const CLEAR_OLD_LOGS_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to one replica of a replicated table.
#[derive(Clone)]
pub struct ReplicatedTable {
    core: Arc<TableCore>,
}

struct BackgroundTasks {
    queue_updating: Option<JoinHandle<()>>,
    merge_selecting: Option<JoinHandle<()>>,
    clear_old_blocks: Option<JoinHandle<()>>,
}

pub(crate) struct TableCore {
    pub(crate) schema: TableSchema,
    pub(crate) settings: ReplicationSettings,
    pub(crate) replica_name: String,
    pub(crate) paths: TablePaths,
    pub(crate) my_paths: ReplicaPaths,

    service: Option<Arc<CoordinatorService>>,
    coordinator: RwLock<Option<Coordinator>>,

    pub(crate) store: Arc<PartStore>,
    pub(crate) unreplicated: Option<Arc<PartStore>>,
    pub(crate) queue: ReplicationQueue,
    pub(crate) pool: BackgroundPool,
    queue_task: Mutex<Option<TaskHandle>>,

    exchange: Arc<ExchangeHandler>,
    endpoint_holder: Mutex<Option<EndpointHolder>>,
    advertised_host: String,
    exchange_port: u16,

    pub(crate) merge_selecting_event: Notify,

    // Distinguishes a stale is_active node left by a previous session of
    // this same process from one held by another live replica.
    active_node_identifier: String,
    replica_is_active: Mutex<Option<EphemeralNodeHolder>>,
    leader_election: Mutex<Option<LeaderElection>>,

    pub(crate) is_leader: AtomicBool,
    pub(crate) shutdown_called: AtomicBool,
    permanent_shutdown: AtomicBool,
    is_read_only: AtomicBool,

    // Writers hold this shared; the restarter holds it exclusively while
    // swapping the coordinator handle.
    pub(crate) structure_lock: tokio::sync::RwLock<()>,

    tasks: Mutex<BackgroundTasks>,
    restarting_task: Mutex<Option<JoinHandle<()>>>,
    clear_old_logs_after: Mutex<Instant>,
}

impl ReplicatedTable {
    /// Open (or create) one replica of a replicated table.
    ///
    /// With `attach` the replica is expected to already exist in the
    /// coordinator and local parts are reconciled against it; without it
    /// the table and replica subtrees are created. A missing coordination
    /// service degrades the table to read-only.
    pub async fn open(
        config: WolfTableConfig,
        service: Option<Arc<CoordinatorService>>,
        exchange: Arc<ExchangeHandler>,
        exchange_port: u16,
        attach: bool,
    ) -> Result<ReplicatedTable> {
        config.validate()?;
        let schema = config.table;
        let settings = config.replication;
        let replica_name = config.node.replica_name;

        let table_dir = config.node.data_dir.join(&schema.name);
        let store = Arc::new(PartStore::open(
            table_dir.join("data"),
            settings.old_parts_lifetime(),
        )?);
        let unreplicated_dir = table_dir.join("unreplicated");
        let unreplicated = if unreplicated_dir.exists() {
            info!("have unreplicated data");
            Some(Arc::new(PartStore::open(
                unreplicated_dir,
                settings.old_parts_lifetime(),
            )?))
        } else {
            None
        };

        let paths = TablePaths::new(schema.coordinator_path.clone());
        let my_paths = paths.replica(&replica_name);
        let pool_size = settings.background_pool_size;

        let core = Arc::new(TableCore {
            schema,
            settings,
            replica_name,
            my_paths,
            paths,
            service,
            coordinator: RwLock::new(None),
            store,
            unreplicated,
            queue: ReplicationQueue::new(),
            pool: BackgroundPool::new(pool_size),
            queue_task: Mutex::new(None),
            exchange,
            endpoint_holder: Mutex::new(None),
            advertised_host: config.node.host,
            exchange_port,
            merge_selecting_event: Notify::new(),
            active_node_identifier: format!("{}-{:016x}", std::process::id(), rand::random::<u64>()),
            replica_is_active: Mutex::new(None),
            leader_election: Mutex::new(None),
            is_leader: AtomicBool::new(false),
            shutdown_called: AtomicBool::new(false),
            permanent_shutdown: AtomicBool::new(false),
            is_read_only: AtomicBool::new(false),
            structure_lock: tokio::sync::RwLock::new(()),
            tasks: Mutex::new(BackgroundTasks {
                queue_updating: None,
                merge_selecting: None,
                clear_old_blocks: None,
            }),
            restarting_task: Mutex::new(None),
            clear_old_logs_after: Mutex::new(Instant::now()),
        });

        let Some(service) = &core.service else {
            warn!("no coordination service, table starts read-only");
            core.enter_read_only();
            return Ok(ReplicatedTable { core });
        };
        *core.coordinator.write().unwrap() = Some(service.connect());

        let bootstrapped: Result<()> = async {
            let coordinator = core.coordinator()?;
            if !attach {
                if !coordinator.exists(core.paths.root())? {
                    core.create_table(&coordinator)?;
                }
                core.check_table_structure(&coordinator)?;
                core.create_replica(&coordinator).await?;
            } else {
                core.check_table_structure(&coordinator)?;
                core.check_parts(&coordinator)?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = bootstrapped {
            core.pool.shutdown().await;
            return Err(err);
        }

        let supplier: Arc<dyn PartSupplier> = Arc::clone(&core.store) as Arc<dyn PartSupplier>;
        *core.endpoint_holder.lock().unwrap() = Some(
            core.exchange
                .register(core.my_paths.root().to_string(), &supplier),
        );

        let restarting_core = Arc::clone(&core);
        *core.restarting_task.lock().unwrap() =
            Some(tokio::spawn(async move { restarting_core.restarting().await }));

        Ok(ReplicatedTable { core })
    }

    /// Permanently stop the replica: background loops are joined and the
    /// ephemeral presence nodes released. The table handle stays usable
    /// for reads.
    pub async fn shutdown(&self) {
        self.core.permanent_shutdown.store(true, Ordering::SeqCst);
        let restarting = self.core.restarting_task.lock().unwrap().take();
        if let Some(task) = restarting {
            let _ = task.await;
        }
        self.core.pool.shutdown().await;
    }

    /// Read every row of the table (unreplicated parts first).
    pub fn read(&self) -> Result<Vec<serde_json::Value>> {
        let mut rows = Vec::new();
        if let Some(unreplicated) = &self.core.unreplicated {
            read_store_rows(unreplicated, &mut rows)?;
        }
        read_store_rows(&self.core.store, &mut rows)?;
        Ok(rows)
    }

    /// Insert a block of rows. Blocks the coordinator has already seen
    /// (same insert id or content hash) are dropped without effect.
    pub async fn write(
        &self,
        rows: Vec<serde_json::Value>,
        insert_id: Option<String>,
    ) -> Result<WriteOutcome> {
        self.core.write_block(rows, insert_id).await
    }

    /// Merge the unreplicated partition, if present. Replicated merges
    /// are scheduled by the leader on its own.
    pub async fn optimize(&self) -> Result<bool> {
        let Some(unreplicated) = &self.core.unreplicated else {
            return Ok(false);
        };
        unreplicated.clear_old_parts();

        let parts = unreplicated.parts();
        let Some(selected) = merge_selector::select_parts_to_merge(
            &parts,
            usize::MAX,
            &mut |_, _| Ok(true),
        )?
        else {
            return Ok(false);
        };

        let new_name = merge_selector::merged_part_name(&selected);
        let temp = unreplicated.merge_parts(&selected, &new_name)?;
        unreplicated.rename_temp_and_replace(temp)?;
        Ok(true)
    }

    /// Drop this replica: remove its coordinator subtree (and the whole
    /// table subtree when it is the last replica), then the local data.
    pub async fn drop_table(self) -> Result<()> {
        self.shutdown().await;
        let core = &self.core;

        if let Ok(coordinator) = core.coordinator() {
            info!(replica = %core.my_paths.root(), "removing replica");
            coordinator.remove_recursive(core.my_paths.root())?;
            if coordinator.children(&core.paths.replicas())?.is_empty() {
                info!(table = %core.paths.root(), "removing table");
                coordinator.remove_recursive(core.paths.root())?;
            }
        }

        core.store.drop_all()?;
        if let Some(unreplicated) = &core.unreplicated {
            unreplicated.drop_all()?;
        }
        Ok(())
    }

    pub fn replica_name(&self) -> &str {
        &self.core.replica_name
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }

    /// Names of the active local parts.
    pub fn part_names(&self) -> Vec<String> {
        self.core
            .store
            .parts()
            .iter()
            .map(|meta| meta.name.to_string())
            .collect()
    }

    /// The session id of the current coordinator handle, for operational
    /// tooling (and for killing sessions in tests).
    pub fn coordinator_session(&self) -> Option<u64> {
        self.core
            .coordinator
            .read()
            .unwrap()
            .as_ref()
            .map(|coordinator| coordinator.session_id())
    }
}

fn read_store_rows(store: &PartStore, rows: &mut Vec<serde_json::Value>) -> Result<()> {
    for meta in store.parts() {
        let payload = store.read_payload(&meta.name.to_string())?;
        for line in payload.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            let row = serde_json::from_slice(line)
                .map_err(|err| Error::Internal(format!("corrupt row in {}: {err}", meta.name)))?;
            rows.push(row);
        }
    }
    Ok(())
}

impl TableCore {
    /// The current coordinator handle.
    pub(crate) fn coordinator(&self) -> Result<Coordinator> {
        self.coordinator
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::CoordinatorUnavailable)
    }

    pub(crate) fn queue_task_handle(&self) -> Option<TaskHandle> {
        self.queue_task.lock().unwrap().clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }

    /// Announce this replica as active: atomically create the ephemeral
    /// `is_active` node and publish the exchange address. A stale
    /// `is_active` left by a previous session of this process is removed
    /// first.
    fn activate_replica(self: &Arc<Self>) -> Result<()> {
        let coordinator = self.coordinator()?;

        if let Some(current) = coordinator.try_get(&self.my_paths.is_active())? {
            if current == self.active_node_identifier {
                coordinator.try_remove(&self.my_paths.is_active())?;
            }
        }

        let host_entry = exchange::format_host_entry(&self.advertised_host, self.exchange_port);
        let result = coordinator.multi(vec![
            Op::create(
                self.my_paths.is_active(),
                self.active_node_identifier.clone(),
                CreateMode::Ephemeral,
            ),
            Op::set(self.my_paths.host(), host_entry),
        ]);
        match result {
            Ok(_) => {}
            Err(Error::NodeExists(_)) => {
                return Err(Error::ReplicaIsAlreadyActive(
                    self.my_paths.root().to_string(),
                ))
            }
            Err(err) => return Err(err),
        }

        *self.replica_is_active.lock().unwrap() = Some(EphemeralNodeHolder::existing(
            coordinator,
            self.my_paths.is_active(),
        ));
        Ok(())
    }

    /// Bring the replica up on the current coordinator session.
    async fn startup(self: &Arc<Self>) -> Result<()> {
        self.shutdown_called.store(false, Ordering::SeqCst);
        self.store.uncancel_merges();
        if let Some(unreplicated) = &self.unreplicated {
            unreplicated.uncancel_merges();
        }

        self.activate_replica()?;

        // Rebuild queue state from the coordinator rather than trusting
        // what the previous session left in memory.
        let coordinator = self.coordinator()?;
        let local_parts: Vec<_> = self
            .store
            .parts()
            .iter()
            .map(|meta| meta.name.clone())
            .collect();
        self.queue.load(&coordinator, &self.my_paths, &local_parts)?;

        let election_core = Arc::downgrade(self);
        *self.leader_election.lock().unwrap() = Some(LeaderElection::start(
            coordinator,
            &self.paths.leader_election(),
            &self.replica_name,
            Box::new(move || {
                if let Some(core) = election_core.upgrade() {
                    core.become_leader();
                }
            }),
        )?);

        let queue_core = Arc::clone(self);
        self.tasks.lock().unwrap().queue_updating =
            Some(tokio::spawn(async move { queue_core.queue_updating().await }));

        let task_core = Arc::downgrade(self);
        let handle = self.pool.add_task(move || {
            let task_core = task_core.clone();
            async move {
                match task_core.upgrade() {
                    Some(core) => core.queue_task().await,
                    None => false,
                }
            }
        });
        *self.queue_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Stop everything tied to the current coordinator session.
    async fn partial_shutdown(&self) {
        *self.leader_election.lock().unwrap() = None;
        self.shutdown_called.store(true, Ordering::SeqCst);
        *self.replica_is_active.lock().unwrap() = None;

        self.store.cancel_merges();
        if let Some(unreplicated) = &self.unreplicated {
            unreplicated.cancel_merges();
        }

        trace!("waiting for background tasks to finish");
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.merge_selecting_event.notify_one();
        }
        self.join_background_tasks().await;
        trace!("background tasks finished");
    }

    async fn join_background_tasks(&self) {
        let (queue_updating, merge_selecting, clear_old_blocks) = {
            let mut tasks = self.tasks.lock().unwrap();
            (
                tasks.queue_updating.take(),
                tasks.merge_selecting.take(),
                tasks.clear_old_blocks.take(),
            )
        };
        for task in [queue_updating, merge_selecting, clear_old_blocks]
            .into_iter()
            .flatten()
        {
            let _ = task.await;
        }

        let handle = self.queue_task.lock().unwrap().take();
        if let Some(handle) = handle {
            self.pool.remove_task(&handle).await;
        }
    }

    /// The `restarting` loop: bring the replica up, then watch the
    /// session and rebuild everything on a fresh one when it expires. Any
    /// unrecoverable error leaves the table permanently read-only.
    async fn restarting(self: Arc<Self>) {
        let result: Result<()> = async {
            self.startup().await?;

            while !self.permanent_shutdown.load(Ordering::SeqCst) {
                let expired = match self.coordinator() {
                    Ok(coordinator) => coordinator.expired(),
                    Err(_) => true,
                };
                if expired {
                    warn!("coordinator session has expired, switching to a new session");

                    trace!("locking all write operations");
                    let _structure_guard = self.structure_lock.write().await;
                    self.partial_shutdown().await;

                    let service = self.service.as_ref().ok_or(Error::CoordinatorUnavailable)?;
                    *self.coordinator.write().unwrap() = Some(service.connect());

                    self.startup().await?;
                }

                tokio::time::sleep(self.settings.restart_poll_interval()).await;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!(error = %err, "exception in restarting task, the table will be read-only until restart");
            self.go_read_only().await;
            return;
        }

        *self.endpoint_holder.lock().unwrap() = None;
        self.partial_shutdown().await;
    }

    fn enter_read_only(&self) {
        self.is_read_only.store(true, Ordering::SeqCst);
        self.shutdown_called.store(true, Ordering::SeqCst);
        self.permanent_shutdown.store(true, Ordering::SeqCst);
    }

    /// Degrade permanently: reads keep working, everything else stops.
    async fn go_read_only(&self) {
        info!("going to read-only mode");
        self.enter_read_only();

        *self.leader_election.lock().unwrap() = None;
        *self.replica_is_active.lock().unwrap() = None;
        *self.endpoint_holder.lock().unwrap() = None;
        self.store.cancel_merges();
        if let Some(unreplicated) = &self.unreplicated {
            unreplicated.cancel_merges();
        }

        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.merge_selecting_event.notify_one();
        }
        self.join_background_tasks().await;
    }

    /// The `queue_updating` loop: pull logs, reap old parts, and once a
    /// minute trim this replica's log.
    async fn queue_updating(self: Arc<Self>) {
        while !self.is_shutting_down() {
            if let Err(err) = self.queue_update_pass() {
                if matches!(err, Error::SessionExpired) {
                    trace!("queue update hit an expired session");
                } else {
                    warn!(error = %err, "queue update failed");
                }
            }
            tokio::time::sleep(self.settings.queue_update_interval()).await;
        }
    }

    fn queue_update_pass(&self) -> Result<()> {
        let coordinator = self.coordinator()?;
        self.queue.pull_logs_to_queue(
            &coordinator,
            &self.paths,
            &self.my_paths,
            self.queue_task_handle().as_ref(),
        )?;

        self.clear_old_parts(&coordinator);

        let due = {
            let mut after = self.clear_old_logs_after.lock().unwrap();
            if Instant::now() >= *after {
                *after = Instant::now() + CLEAR_OLD_LOGS_INTERVAL;
                true
            } else {
                false
            }
        };
        if due {
            self.clear_old_logs(&coordinator)?;
        }
        Ok(())
    }
}
