//! Insert Path
//!
//! Commits a block of rows as new local parts (one per month partition)
//! and registers them in the coordinator together with their dedup block
//! records. The block id (an explicit insert id, or the content hash of
//! the serialized rows) deduplicates retried inserts: a block id the
//! coordinator has already seen is dropped without effect. The reserved
//! block number is released as committed inside the registration multi;
//! if the insert loses a dedup race the number is abandoned instead,
//! which later lets merges skip over the gap it leaves.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::coordinator::{AbandonableLock, CreateMode, Op};
use crate::error::{Error, Result};
use crate::part::PartName;
use crate::replication::LogEntry;
use crate::table::TableCore;

/// Result of one insert.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Names of the parts written by this insert.
    pub written_parts: Vec<String>,
    /// Number of month blocks dropped as duplicates.
    pub deduplicated: usize,
}

struct MonthBlock {
    month: String,
    min_date: NaiveDate,
    payload: Vec<u8>,
    rows: u64,
}

impl TableCore {
    pub(crate) async fn write_block(
        &self,
        rows: Vec<serde_json::Value>,
        insert_id: Option<String>,
    ) -> Result<WriteOutcome> {
        if self.is_read_only.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::TableIsReadOnly);
        }

        // Excluded while the restarter swaps the coordinator handle.
        let _structure_guard = self.structure_lock.read().await;
        let coordinator = self.coordinator()?;

        let blocks = self.split_into_month_blocks(rows)?;
        if insert_id.is_some() && blocks.len() > 1 {
            return Err(Error::InvalidRow(
                "an explicit insert id requires rows from a single month".into(),
            ));
        }

        let mut outcome = WriteOutcome::default();
        for block in blocks.into_values() {
            let block_id = match &insert_id {
                Some(id) => id.clone(),
                None => hex::encode(Sha256::digest(&block.payload)),
            };

            if coordinator.exists(&self.paths.block(&block_id))? {
                debug!(block = %block_id, "block is a duplicate, skipping");
                outcome.deduplicated += 1;
                continue;
            }

            // The month node appears with the partition's first insert.
            match coordinator.create(
                &self.paths.block_numbers_month(&block.month),
                "",
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(err) => return Err(err),
            }

            let mut lock = AbandonableLock::acquire(
                &coordinator,
                &self.paths.temp(),
                &self.paths.block_numbers_month(&block.month),
            )?;
            let number = lock.number();

            let name = PartName::new(
                block.min_date.format("%Y%m%d").to_string(),
                number,
                number,
                0,
            );
            let temp = self.store.write_temp(&name, &block.payload, block.rows)?;

            let mut ops = vec![
                Op::create(self.paths.block(&block_id), "", CreateMode::Persistent),
                Op::create(
                    self.paths.block_checksums(&block_id),
                    temp.meta.checksums.to_text(),
                    CreateMode::Persistent,
                ),
                Op::create(
                    self.paths.block_number_field(&block_id),
                    number.to_string(),
                    CreateMode::Persistent,
                ),
            ];
            ops.extend(self.check_part_and_add_ops(&coordinator, &temp.meta)?);
            // Announce the new part in our log so peers queue a fetch.
            let log_entry = LogEntry::Get {
                source_replica: self.replica_name.clone(),
                new_part_name: name.to_string(),
            };
            ops.push(Op::create(
                self.my_paths.log_prefix(),
                log_entry.to_text(),
                CreateMode::PersistentSequential,
            ));
            ops.extend(lock.unlock_ops());

            match coordinator.multi(ops) {
                Ok(_) => {
                    lock.mark_released();
                    self.store.rename_temp_and_replace(temp)?;
                    self.queue.add_virtual_part(name.clone());
                    self.merge_selecting_event.notify_one();
                    debug!(part = %name, "wrote part");
                    outcome.written_parts.push(name.to_string());
                }
                Err(Error::NodeExists(path)) if path == self.paths.block(&block_id) => {
                    // Lost a dedup race with a concurrent identical
                    // insert; leave the number behind as abandoned.
                    debug!(block = %block_id, "block became a duplicate while inserting");
                    lock.abandon()?;
                    outcome.deduplicated += 1;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    fn split_into_month_blocks(
        &self,
        rows: Vec<serde_json::Value>,
    ) -> Result<BTreeMap<String, MonthBlock>> {
        let date_column = &self.schema.date_column;
        let mut blocks: BTreeMap<String, MonthBlock> = BTreeMap::new();

        for row in rows {
            let date_text = row
                .get(date_column)
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    Error::InvalidRow(format!("row is missing date column `{date_column}`"))
                })?;
            let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d").map_err(|_| {
                Error::InvalidRow(format!("bad value {date_text:?} in date column"))
            })?;

            let month = date.format("%Y%m").to_string();
            let line = serde_json::to_string(&row)
                .map_err(|err| Error::InvalidRow(err.to_string()))?;

            let block = blocks.entry(month.clone()).or_insert_with(|| MonthBlock {
                month,
                min_date: date,
                payload: Vec::new(),
                rows: 0,
            });
            block.min_date = block.min_date.min(date);
            block.payload.extend_from_slice(line.as_bytes());
            block.payload.push(b'\n');
            block.rows += 1;
        }

        Ok(blocks)
    }
}
