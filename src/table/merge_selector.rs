//! Merge Selector
//!
//! Leader-only loop that picks adjacent runs of parts to compact and
//! publishes MERGE entries to this replica's log. A pair of parts is
//! mergeable only when both are their own maximal cover among the
//! virtual parts, both are registered under this replica in the
//! coordinator, and every block number in the gap between them was
//! abandoned by an insert that never completed. After publishing, the log
//! is pulled immediately so the virtual parts reflect the pending merge
//! before the next selection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{AbandonableLock, Coordinator, CreateMode, LockState};
use crate::error::Result;
use crate::part::{PartMeta, PartName};
use crate::replication::LogEntry;
use crate::table::TableCore;

impl TableCore {
    /// Invoked by the election when this replica owns the smallest
    /// election node.
    pub(crate) fn become_leader(self: &Arc<Self>) {
        info!("became leader");
        self.is_leader.store(true, Ordering::SeqCst);

        let selecting_core = Arc::clone(self);
        let selecting: JoinHandle<()> =
            tokio::spawn(async move { selecting_core.merge_selecting().await });
        let blocks_core = Arc::clone(self);
        let blocks: JoinHandle<()> =
            tokio::spawn(async move { blocks_core.clear_old_blocks_loop().await });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.merge_selecting = Some(selecting);
        tasks.clear_old_blocks = Some(blocks);
    }

    /// The `merge_selecting` loop.
    async fn merge_selecting(self: Arc<Self>) {
        // Catch up first so virtual parts are current before selecting.
        if let Ok(coordinator) = self.coordinator() {
            if let Err(err) = self.queue.pull_logs_to_queue(
                &coordinator,
                &self.paths,
                &self.my_paths,
                self.queue_task_handle().as_ref(),
            ) {
                warn!(error = %err, "initial log pull failed");
            }
        }

        while !self.is_shutting_down() && self.is_leader.load(Ordering::SeqCst) {
            let success = match self.select_merge_once() {
                Ok(success) => success,
                Err(err) => {
                    warn!(error = %err, "merge selection failed");
                    false
                }
            };

            if self.is_shutting_down() || !self.is_leader.load(Ordering::SeqCst) {
                break;
            }
            if !success {
                let _ = tokio::time::timeout(
                    self.settings.merge_selecting_sleep(),
                    self.merge_selecting_event.notified(),
                )
                .await;
            }
        }
    }

    /// Attempt one selection; returns whether a merge was published.
    fn select_merge_once(&self) -> Result<bool> {
        let coordinator = self.coordinator()?;

        let queued_merges = self.queue.merge_entries();
        let merges_queued = queued_merges.len();
        if merges_queued >= self.settings.max_replicated_merges_in_queue {
            return Ok(false);
        }

        // A big merge in flight (or still queued) keeps further big
        // merges from being scheduled.
        let mut has_big_merge = self.pool.counter("replicated big merges") > 0;
        if !has_big_merge {
            'outer: for entry in &queued_merges {
                if let LogEntry::Merge { parts_to_merge, .. } = entry {
                    for input in parts_to_merge {
                        match self.store.get_part(input) {
                            Some(part) if self.is_big_part(&part) => {
                                has_big_merge = true;
                                break 'outer;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        let parts = self.store.parts();
        let mut can_merge = |left: &PartMeta, right: &PartMeta| -> Result<bool> {
            if has_big_merge && (self.is_big_part(left) || self.is_big_part(right)) {
                return Ok(false);
            }
            self.can_merge_parts(&coordinator, left, right)
        };
        let Some(selected) = select_parts_to_merge(
            &parts,
            self.settings.max_parts_per_merge,
            &mut can_merge,
        )?
        else {
            return Ok(false);
        };

        let new_part = merged_part_name(&selected);
        let entry = LogEntry::Merge {
            source_replica: self.replica_name.clone(),
            parts_to_merge: selected
                .iter()
                .map(|part| part.name.to_string())
                .collect(),
            new_part_name: new_part.to_string(),
        };
        coordinator.create(
            &self.my_paths.log_prefix(),
            &entry.to_text(),
            CreateMode::PersistentSequential,
        )?;
        debug!(merge = %new_part, "published merge entry");

        // Ingest the entry before the next selection so the merged
        // result appears among the virtual parts right away.
        self.queue.pull_logs_to_queue(
            &coordinator,
            &self.paths,
            &self.my_paths,
            self.queue_task_handle().as_ref(),
        )?;

        // The block numbers strictly between the merged ranges are no
        // longer needed.
        let month = selected[0].name.month().to_string();
        for pair in selected.windows(2) {
            for number in (pair[0].name.right + 1)..pair[1].name.left {
                coordinator.try_remove(&self.paths.block_number(&month, number))?;
            }
        }

        Ok(true)
    }

    /// Whether two adjacent parts may be merged.
    pub(crate) fn can_merge_parts(
        &self,
        coordinator: &Coordinator,
        left: &PartMeta,
        right: &PartMeta,
    ) -> Result<bool> {
        // A part already chosen as input of a pending merge is covered by
        // that merge's output among the virtual parts.
        if !self.queue.is_virtual_self_maximal(&left.name)
            || !self.queue.is_virtual_self_maximal(&right.name)
        {
            return Ok(false);
        }

        if !coordinator.exists(&self.my_paths.part(&left.name.to_string()))?
            || !coordinator.exists(&self.my_paths.part(&right.name.to_string()))?
        {
            return Ok(false);
        }

        let month = left.name.month();
        for number in (left.name.right + 1)..right.name.left {
            let path = self.paths.block_number(month, number);
            if AbandonableLock::check(coordinator, &path)? != LockState::Abandoned {
                debug!(
                    left = %left.name,
                    right = %right.name,
                    block = %path,
                    "can't merge parts because block exists"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Name of the part produced by merging `parts` (ordered, same month).
pub(crate) fn merged_part_name(parts: &[Arc<PartMeta>]) -> PartName {
    let prefix = parts
        .iter()
        .map(|part| part.name.prefix.as_str())
        .min()
        .unwrap_or_default()
        .to_string();
    PartName {
        prefix,
        left: parts.first().map(|part| part.name.left).unwrap_or(0),
        right: parts.last().map(|part| part.name.right).unwrap_or(0),
        level: parts
            .iter()
            .map(|part| part.name.level)
            .max()
            .unwrap_or(0)
            + 1,
    }
}

/// Pick the longest run of at least two adjacent parts within one month
/// for which every consecutive pair satisfies `can_merge`.
pub(crate) fn select_parts_to_merge(
    parts: &[Arc<PartMeta>],
    max_parts: usize,
    can_merge: &mut dyn FnMut(&PartMeta, &PartMeta) -> Result<bool>,
) -> Result<Option<Vec<Arc<PartMeta>>>> {
    let mut best: Option<(usize, usize)> = None;

    let mut start = 0;
    while start < parts.len() {
        let mut end = start;
        while end + 1 < parts.len()
            && end + 1 - start + 1 <= max_parts
            && parts[end].name.month() == parts[end + 1].name.month()
            && can_merge(&parts[end], &parts[end + 1])?
        {
            end += 1;
        }

        if end > start {
            let length = end - start + 1;
            if best.map_or(true, |(b_start, b_end)| length > b_end - b_start + 1) {
                best = Some((start, end));
            }
            start = end + 1;
        } else {
            start += 1;
        }
    }

    Ok(best.map(|(start, end)| parts[start..=end].to_vec()))
}
