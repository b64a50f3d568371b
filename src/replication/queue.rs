//! Replication Queue
//!
//! The per-replica FIFO of pending operations, together with the virtual
//! parts index (everything local or in flight, as a covering antichain)
//! and the future parts set (outputs currently being produced). All three
//! live under one mutex which is only held for in-memory work.
//!
//! The log puller merge-sorts the heads of every replica's log by
//! coordinator creation stamp (ties broken by replica name, which makes
//! the order total) and for each entry atomically appends it to this
//! replica's queue and advances the matching log pointer in a single
//! multi-op, so a pointer never runs ahead of what has been enqueued.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::coordinator::{paths, Coordinator, CreateMode, Op, OpResult, ReplicaPaths, TablePaths};
use crate::error::{Error, Result};
use crate::part::{ActivePartSet, PartName};
use crate::pool::TaskHandle;
use crate::replication::{LogEntry, QueueEntry};

struct QueueInner {
    entries: VecDeque<QueueEntry>,
    virtual_parts: ActivePartSet,
    future_parts: HashSet<String>,
}

/// The replication work queue of one replica.
pub struct ReplicationQueue {
    inner: Mutex<QueueInner>,
    // Serializes pullers; the queue mutex itself is never held across
    // coordinator calls.
    pull_lock: Mutex<()>,
}

impl Default for ReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                virtual_parts: ActivePartSet::new(),
                future_parts: HashSet::new(),
            }),
            pull_lock: Mutex::new(()),
        }
    }

    /// Reset in-memory state and reload the queue from the coordinator.
    /// Virtual parts are rebuilt from the given local parts plus the
    /// outputs of every queued entry.
    pub fn load(
        &self,
        coordinator: &Coordinator,
        own: &ReplicaPaths,
        local_parts: &[PartName],
    ) -> Result<()> {
        let children = coordinator.children(&own.queue())?;

        let mut loaded = Vec::with_capacity(children.len());
        for child in children {
            let Some(text) = coordinator.try_get(&own.queue_entry(&child))? else {
                continue;
            };
            loaded.push(QueueEntry {
                znode_name: child,
                entry: LogEntry::parse(&text)?,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.future_parts.clear();
        inner.virtual_parts = ActivePartSet::from_names(local_parts.iter());
        for queued in loaded {
            inner
                .virtual_parts
                .add(queued.entry.new_part_name().parse()?);
            inner.entries.push_back(queued);
        }
        debug!(entries = inner.entries.len(), "loaded replication queue");
        Ok(())
    }

    /// Merge-sort new entries from all replicas' logs into this queue and
    /// advance the per-replica log pointers. Returns how many entries
    /// were pulled.
    pub fn pull_logs_to_queue(
        &self,
        coordinator: &Coordinator,
        table: &TablePaths,
        own: &ReplicaPaths,
        wake: Option<&TaskHandle>,
    ) -> Result<usize> {
        let _pull = self.pull_lock.lock().unwrap();

        let mut heads = BinaryHeap::new();
        for replica in coordinator.children(&table.replicas())? {
            let peer = table.replica(&replica);
            let index = match coordinator.try_get(&own.log_pointer(&replica))? {
                Some(text) => text
                    .parse::<u64>()
                    .map_err(|_| Error::Coordinator(format!("bad log pointer: {text}")))?,
                None => {
                    // First contact with this replica's log: point at its
                    // oldest surviving entry.
                    let index = min_log_index(coordinator, &peer)?;
                    coordinator.create(
                        &own.log_pointer(&replica),
                        &index.to_string(),
                        CreateMode::Persistent,
                    )?;
                    index
                }
            };
            if let Some(head) = read_log_head(coordinator, &peer, replica, index)? {
                heads.push(head);
            }
        }

        let mut pulled = 0;
        while let Some(head) = heads.pop() {
            let entry = LogEntry::parse(&head.entry_str)?;
            let new_part: PartName = entry.new_part_name().parse()?;

            let results = coordinator.multi(vec![
                Op::create(own.queue_prefix(), head.entry_str.clone(), CreateMode::PersistentSequential),
                Op::set(own.log_pointer(&head.replica), (head.index + 1).to_string()),
            ])?;
            let OpResult::Created(created) = &results[0] else {
                return Err(Error::Internal("queue create yielded no path".into()));
            };
            let znode_name = created
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();

            {
                let mut inner = self.inner.lock().unwrap();
                inner.virtual_parts.add(new_part);
                inner.entries.push_back(QueueEntry { znode_name, entry });
            }
            pulled += 1;

            let peer = table.replica(&head.replica);
            if let Some(next) = read_log_head(coordinator, &peer, head.replica, head.index + 1)? {
                heads.push(next);
            }
        }

        if pulled > 0 {
            debug!(pulled, "pulled entries into queue");
            if let Some(wake) = wake {
                wake.wake();
            }
        }
        Ok(pulled)
    }

    /// Pick the first entry eligible for execution, remove it from the
    /// queue and tag its output as in flight.
    pub fn select_entry_to_execute(&self) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .entries
            .iter()
            .position(|queued| should_execute(&queued.entry, &inner.future_parts))?;
        let queued = inner.entries.remove(position)?;
        inner
            .future_parts
            .insert(queued.entry.new_part_name().to_string());
        Some(queued)
    }

    /// Clear the in-flight tag after a successful execution.
    pub fn finish_success(&self, queued: &QueueEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.future_parts.remove(queued.entry.new_part_name());
    }

    /// Put a failed entry back at the tail of the queue.
    pub fn requeue_at_tail(&self, queued: QueueEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.future_parts.remove(queued.entry.new_part_name());
        inner.entries.push_back(queued);
    }

    /// A part we failed to obtain may be an input of a pending merge.
    /// Move every earlier queue item producing one of that merge's inputs
    /// behind the merge, so the next drain attempts the merge itself
    /// (which degrades to fetching its output). Returns whether anything
    /// moved.
    pub fn move_merge_inputs_behind(&self, failed_part: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let Some(merge_position) = inner.entries.iter().position(|queued| {
            matches!(
                &queued.entry,
                LogEntry::Merge { parts_to_merge, .. }
                    if parts_to_merge.iter().any(|part| part == failed_part)
            )
        }) else {
            return false;
        };
        let inputs: HashSet<String> = match &inner.entries[merge_position].entry {
            LogEntry::Merge { parts_to_merge, .. } => parts_to_merge.iter().cloned().collect(),
            _ => unreachable!(),
        };

        let items: Vec<QueueEntry> = inner.entries.drain(..).collect();
        let mut kept = Vec::with_capacity(items.len());
        let mut moved = Vec::new();
        for (position, item) in items.into_iter().enumerate() {
            if position < merge_position && inputs.contains(item.entry.new_part_name()) {
                moved.push(item);
            } else {
                kept.push(item);
            }
        }
        let any_moved = !moved.is_empty();
        inner.entries = kept.into_iter().chain(moved).collect();
        any_moved
    }

    /// Snapshot of the queued MERGE entries.
    pub fn merge_entries(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|queued| queued.entry.is_merge())
            .map(|queued| queued.entry.clone())
            .collect()
    }

    /// Whether `name` is its own maximal cover among the virtual parts.
    pub fn is_virtual_self_maximal(&self, name: &PartName) -> bool {
        self.inner.lock().unwrap().virtual_parts.is_self_maximal(name)
    }

    /// Record a part produced outside the queue (a local insert).
    pub fn add_virtual_part(&self, name: PartName) {
        self.inner.lock().unwrap().virtual_parts.add(name);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn future_parts_len(&self) -> usize {
        self.inner.lock().unwrap().future_parts.len()
    }
}

fn should_execute(entry: &LogEntry, future_parts: &HashSet<String>) -> bool {
    if future_parts.contains(entry.new_part_name()) {
        debug!(
            part = entry.new_part_name(),
            "not executing log entry: another entry for the same part is being processed"
        );
        return false;
    }
    if let LogEntry::Merge { parts_to_merge, .. } = entry {
        for part in parts_to_merge {
            if future_parts.contains(part) {
                trace!(
                    merge = entry.new_part_name(),
                    input = %part,
                    "not merging: input is not ready yet"
                );
                return false;
            }
        }
    }
    true
}

/// One replica's next unread log entry.
struct LogHead {
    czxid: i64,
    replica: String,
    index: u64,
    entry_str: String,
}

// Min-heap by (czxid, replica): BinaryHeap is a max-heap, so reverse.
impl Ord for LogHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.czxid, &other.replica).cmp(&(self.czxid, &self.replica))
    }
}

impl PartialOrd for LogHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LogHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for LogHead {}

fn min_log_index(coordinator: &Coordinator, peer: &ReplicaPaths) -> Result<u64> {
    let entries = coordinator.children(&peer.log())?;
    Ok(entries
        .iter()
        .filter_map(|name| paths::sequential_index(name, "log-").ok())
        .min()
        .unwrap_or(0))
}

fn read_log_head(
    coordinator: &Coordinator,
    peer: &ReplicaPaths,
    replica: String,
    index: u64,
) -> Result<Option<LogHead>> {
    Ok(coordinator
        .try_get_stat(&peer.log_entry(index))?
        .map(|(entry_str, stat)| LogHead {
            czxid: stat.czxid,
            replica,
            index,
            entry_str,
        }))
}
