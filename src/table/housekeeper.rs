//! Housekeeping
//!
//! Reclaims what replication leaves behind: retired local parts (plus
//! their coordinator registrations), log entries every peer has already
//! pulled, and dedup block records beyond the deduplication window.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::coordinator::{paths, Coordinator, Op};
use crate::error::{Error, Result};
use crate::table::TableCore;

const CLEAR_OLD_BLOCKS_SLEEP: Duration = Duration::from_secs(60);
const SHUTDOWN_CHECK: Duration = Duration::from_secs(1);

impl TableCore {
    /// Remove retired local parts and unlink them from the coordinator.
    pub(crate) fn clear_old_parts(&self, coordinator: &Coordinator) {
        let removed = self.store.clear_old_parts();
        for name in &removed {
            let result = coordinator.multi(vec![
                Op::remove(self.my_paths.part_checksums(name)),
                Op::remove(self.my_paths.part(name)),
            ]);
            if let Err(err) = result {
                debug!(part = %name, error = %err, "couldn't remove part from coordinator");
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed old parts");
        }
    }

    /// Trim this replica's log up to the lowest pointer any replica still
    /// holds into it. Aborts when some replica has no pointer yet, since
    /// that replica may still need everything.
    pub(crate) fn clear_old_logs(&self, coordinator: &Coordinator) -> Result<()> {
        let mut min_pointer = u64::MAX;
        for replica in coordinator.children(&self.paths.replicas())? {
            let pointer_path = self
                .paths
                .replica(&replica)
                .log_pointer(&self.replica_name);
            let Some(pointer) = coordinator.try_get(&pointer_path)? else {
                return Ok(());
            };
            let pointer: u64 = pointer
                .parse()
                .map_err(|_| Error::Coordinator(format!("bad log pointer: {pointer}")))?;
            min_pointer = min_pointer.min(pointer);
        }

        let mut removed = 0;
        for entry in coordinator.children(&self.my_paths.log())? {
            let index = paths::sequential_index(&entry, "log-")?;
            if index >= min_pointer {
                break;
            }
            coordinator.remove(&format!("{}/{}", self.my_paths.log(), entry))?;
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "removed old log entries");
        }
        Ok(())
    }

    /// Leader-only loop trimming dedup block records.
    pub(crate) async fn clear_old_blocks_loop(self: Arc<Self>) {
        while !self.is_shutting_down() && self.is_leader.load(Ordering::SeqCst) {
            match self.coordinator() {
                Ok(coordinator) => {
                    if let Err(err) = self.clear_old_blocks(&coordinator) {
                        warn!(error = %err, "clearing old blocks failed");
                    }
                }
                Err(err) => warn!(error = %err, "clearing old blocks failed"),
            }

            // Sleep a minute, but stay responsive to shutdown.
            let naps = CLEAR_OLD_BLOCKS_SLEEP.as_secs() / SHUTDOWN_CHECK.as_secs();
            for _ in 0..naps {
                if self.is_shutting_down() || !self.is_leader.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(SHUTDOWN_CHECK).await;
            }
        }
    }

    /// Trim the oldest dedup block records down to the deduplication
    /// window. To keep the scan cheap, nothing happens until the records
    /// exceed the window by 10%.
    pub(crate) fn clear_old_blocks(&self, coordinator: &Coordinator) -> Result<()> {
        let stat = coordinator
            .exists_stat(&self.paths.blocks())?
            .ok_or_else(|| Error::NoNode(self.paths.blocks()))?;

        let window = self.settings.replicated_deduplication_window;
        if (stat.num_children as f64) < window as f64 * 1.1 {
            return Ok(());
        }
        trace!(
            about = stat.num_children.saturating_sub(window),
            "clearing old blocks"
        );

        let mut timed_blocks = Vec::new();
        for block in coordinator.children(&self.paths.blocks())? {
            if let Some(stat) = coordinator.exists_stat(&self.paths.block(&block))? {
                timed_blocks.push((stat.czxid, block));
            }
        }
        // Newest first; everything past the window goes.
        timed_blocks.sort_by(|a, b| b.cmp(a));

        for (_, block) in timed_blocks.iter().skip(window) {
            let block_path = self.paths.block(block);
            let mut ops: Vec<Op> = coordinator
                .children(&block_path)?
                .into_iter()
                .map(|child| Op::remove(format!("{block_path}/{child}")))
                .collect();
            ops.push(Op::remove(block_path));
            coordinator.multi(ops)?;
        }

        debug!(
            cleared = timed_blocks.len().saturating_sub(window),
            "cleared old blocks"
        );
        Ok(())
    }
}
