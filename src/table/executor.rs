//! Queue Executor
//!
//! Drains the replication queue on the background pool. One invocation
//! executes at most one entry: a MERGE runs the local merger when every
//! input part is present by exact name, and otherwise degrades to
//! fetching the finished part; a GET always fetches. The produced part is
//! registered in the coordinator in the same multi-op that its checksums
//! are published, before the local rename is committed.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, CreateMode, Op};
use crate::error::{Error, Result};
use crate::part::{Checksums, PartMeta, PartName};
use crate::replication::LogEntry;
use crate::table::TableCore;

/// Threshold above which a merge input counts as big, in
/// index-granularity units.
pub(crate) const BIG_MERGE_THRESHOLD: u64 = 25 * 1024 * 1024;

impl TableCore {
    pub(crate) fn is_big_part(&self, meta: &PartMeta) -> bool {
        meta.marks(self.schema.index_granularity) * self.schema.index_granularity
            > BIG_MERGE_THRESHOLD
    }

    /// One background-pool invocation: execute at most one queue entry.
    /// Returns whether an entry was executed successfully.
    pub(crate) async fn queue_task(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let Some(queued) = self.queue.select_entry_to_execute() else {
            return false;
        };

        match self.execute_log_entry(&queued.entry).await {
            Ok(()) => {
                match self.coordinator().and_then(|coordinator| {
                    coordinator.try_remove(&self.my_paths.queue_entry(&queued.znode_name))
                }) {
                    Ok(_) => {}
                    Err(err) => error!(
                        entry = %queued.znode_name,
                        error = %err,
                        "couldn't remove queue entry; there must be a bug somewhere, ignoring it"
                    ),
                }
                self.queue.finish_success(&queued);
                true
            }
            Err(err) => {
                if let Error::NoReplicaHasPart(_) = &err {
                    // Normal while the part's producer is still working.
                    info!("{err}");
                } else {
                    warn!(part = queued.entry.new_part_name(), error = %err, "queue entry failed");
                }
                self.queue.requeue_at_tail(queued);
                false
            }
        }
    }

    pub(crate) async fn execute_log_entry(&self, entry: &LogEntry) -> Result<()> {
        let coordinator = self.coordinator()?;
        let new_part: PartName = entry.new_part_name().parse()?;

        // If a local part already covers the result and the coordinator
        // knows we have it, the entry has already taken effect.
        if let Some(containing) = self.store.containing_part(&new_part) {
            if coordinator.exists(&self.my_paths.part(&containing.name.to_string()))? {
                let own_get = matches!(entry, LogEntry::Get { source_replica, .. }
                    if *source_replica == self.replica_name);
                if !own_get {
                    debug!(part = entry.new_part_name(), "skipping action, part already exists");
                }
                return Ok(());
            }
        }

        if let LogEntry::Get { source_replica, .. } = entry {
            if *source_replica == self.replica_name {
                warn!(
                    part = entry.new_part_name(),
                    "part from own log doesn't exist locally"
                );
            }
        }

        let mut do_fetch = matches!(entry, LogEntry::Get { .. });

        if let LogEntry::Merge { parts_to_merge, .. } = entry {
            match self.gather_merge_inputs(parts_to_merge, entry.new_part_name()) {
                Some(inputs) => {
                    let big = inputs.iter().any(|input| self.is_big_part(input));
                    let _big_tokens = big.then(|| {
                        (
                            self.pool.increment_counter("big merges"),
                            self.pool.increment_counter("replicated big merges"),
                        )
                    });

                    let temp = self.store.merge_parts(&inputs, &new_part)?;
                    let ops = self.check_part_and_add_ops(&coordinator, &temp.meta)?;
                    coordinator.multi(ops)?;
                    self.store.rename_temp_and_replace(temp)?;
                    self.merge_selecting_event.notify_one();
                }
                None => {
                    debug!(
                        part = entry.new_part_name(),
                        "don't have all parts for merge, will try to fetch it instead"
                    );
                    do_fetch = true;
                }
            }
        }

        if do_fetch {
            if let Err(err) = self.fetch_from_any_replica(&coordinator, entry.new_part_name()).await
            {
                // Fetching an input of a pending merge failed: rather than
                // retrying the inputs one by one, try the merged result
                // sooner by moving the other input fetches behind the
                // merge entry.
                self.queue.move_merge_inputs_behind(entry.new_part_name());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Every merge input, but only when each is present by exact name.
    fn gather_merge_inputs(
        &self,
        parts_to_merge: &[String],
        new_part_name: &str,
    ) -> Option<Vec<Arc<PartMeta>>> {
        let mut inputs = Vec::with_capacity(parts_to_merge.len());
        for name in parts_to_merge {
            let parsed: PartName = name.parse().ok()?;
            let part = self.store.containing_part(&parsed)?;
            if part.name.to_string() != *name {
                error!(
                    input = %name,
                    covered_by = %part.name,
                    merge = new_part_name,
                    "log and parts set look inconsistent"
                );
                return None;
            }
            inputs.push(part);
        }
        Some(inputs)
    }

    async fn fetch_from_any_replica(
        &self,
        coordinator: &Coordinator,
        part_name: &str,
    ) -> Result<()> {
        let Some(replica) = self.find_replica_having_part(coordinator, part_name, true)? else {
            return Err(Error::NoReplicaHasPart(part_name.to_string()));
        };
        self.fetch_part(coordinator, part_name, &replica).await
    }

    /// A replica that advertises this part, chosen uniformly among the
    /// eligible ones.
    pub(crate) fn find_replica_having_part(
        &self,
        coordinator: &Coordinator,
        part_name: &str,
        active_only: bool,
    ) -> Result<Option<String>> {
        let mut replicas = coordinator.children(&self.paths.replicas())?;
        replicas.shuffle(&mut rand::thread_rng());

        for replica in replicas {
            let peer = self.paths.replica(&replica);
            if coordinator.exists(&peer.part(part_name))?
                && (!active_only || coordinator.exists(&peer.is_active())?)
            {
                return Ok(Some(replica));
            }
        }
        Ok(None)
    }

    /// Download a part from `replica`, register it and activate it
    /// locally.
    pub(crate) async fn fetch_part(
        &self,
        coordinator: &Coordinator,
        part_name: &str,
        replica: &str,
    ) -> Result<()> {
        debug!(part = part_name, from = replica, "fetching part");

        let peer = self.paths.replica(replica);
        let host_entry = coordinator.get(&peer.host())?;
        let (host, port) = crate::exchange::parse_host_entry(&host_entry)?;

        let fetched =
            crate::exchange::fetch_part(&host, port, peer.root(), part_name).await?;
        let name: PartName = fetched.part_name.parse()?;
        let temp = self
            .store
            .write_temp(&name, &fetched.payload, fetched.rows)?;

        let ops = self.check_part_and_add_ops(coordinator, &temp.meta)?;
        coordinator.multi(ops)?;
        let (_, replaced) = self.store.rename_temp_and_replace(temp)?;
        self.merge_selecting_event.notify_one();

        for obsolete in replaced {
            debug!(
                part = %obsolete,
                by = part_name,
                "part rendered obsolete by fetch"
            );
        }
        debug!(part = part_name, from = replica, "fetched part");
        Ok(())
    }

    /// Registration ops for a finished part. When some replica already
    /// advertises the same name, its published checksums must match ours;
    /// a peer mid-registration (no checksums child yet) is skipped.
    pub(crate) fn check_part_and_add_ops(
        &self,
        coordinator: &Coordinator,
        meta: &PartMeta,
    ) -> Result<Vec<Op>> {
        let part_name = meta.name.to_string();
        if let Some(other) = self.find_replica_having_part(coordinator, &part_name, false)? {
            let peer = self.paths.replica(&other);
            if let Some(text) = coordinator.try_get(&peer.part_checksums(&part_name))? {
                let theirs = Checksums::parse(&text)?;
                theirs.check_equal(&meta.checksums, &part_name, true)?;
            }
        }

        Ok(vec![
            Op::create(self.my_paths.part(&part_name), "", CreateMode::Persistent),
            Op::create(
                self.my_paths.part_checksums(&part_name),
                meta.checksums.to_text(),
                CreateMode::Persistent,
            ),
        ])
    }
}
