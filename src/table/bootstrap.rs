//! Bootstrap and Sanity Reconciliation
//!
//! Creating the shared table subtree, validating the local schema against
//! it, registering a fresh replica (mirroring an existing one), and, on
//! attach, reconciling the local part set with what the coordinator
//! believes this replica has.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, CreateMode, Op};
use crate::error::{Error, Result};
use crate::part::{ActivePartSet, PartMeta, PartName};
use crate::replication::LogEntry;
use crate::table::{metadata, TableCore};

const PEER_ACK_POLL: Duration = Duration::from_secs(5);

impl TableCore {
    /// Create the shared table subtree and publish the serialized schema.
    pub(crate) fn create_table(&self, coordinator: &Coordinator) -> Result<()> {
        debug!(table = %self.paths.root(), "creating table");

        create_with_ancestors(coordinator, self.paths.root())?;
        coordinator.create(
            &self.paths.metadata(),
            &metadata::metadata_text(&self.schema),
            CreateMode::Persistent,
        )?;
        for path in [
            self.paths.replicas(),
            self.paths.blocks(),
            self.paths.block_numbers(),
            self.paths.leader_election(),
            self.paths.temp(),
        ] {
            coordinator.create(&path, "", CreateMode::Persistent)?;
        }
        Ok(())
    }

    /// Assert that the coordinator's metadata matches the local schema.
    pub(crate) fn check_table_structure(&self, coordinator: &Coordinator) -> Result<()> {
        let found = coordinator.get(&self.paths.metadata())?;
        metadata::check_metadata(&self.schema, &found)
    }

    /// Register this replica and catch it up against an existing one.
    ///
    /// The peer list is snapshotted first; replicas created concurrently
    /// with active writers may miss a small window of log entries.
    /// Entries can be duplicated into the new queue but never lost.
    pub(crate) async fn create_replica(&self, coordinator: &Coordinator) -> Result<()> {
        debug!(replica = %self.my_paths.root(), "creating replica");

        let replicas = coordinator.children(&self.paths.replicas())?;

        coordinator.create(self.my_paths.root(), "", CreateMode::Persistent)?;
        coordinator.create(&self.my_paths.host(), "", CreateMode::Persistent)?;
        for path in [
            self.my_paths.log(),
            self.my_paths.log_pointers(),
            self.my_paths.queue(),
            self.my_paths.parts(),
            self.my_paths.flags(),
        ] {
            coordinator.create(&path, "", CreateMode::Persistent)?;
        }

        if replicas.is_empty() {
            debug!("no other replicas");
            return Ok(());
        }

        // Wait until every peer either notices this replica (so it stops
        // trimming log entries we still need) or goes inactive; prefer an
        // active peer as the mirror.
        let mut source_replica = replicas[0].clone();
        for replica in &replicas {
            debug!(peer = %replica, "waiting for peer to acknowledge this replica");
            let peer = self.paths.replica(replica);

            let mut active = true;
            loop {
                let (peer_active, watch) = coordinator.exists_watch(&peer.is_active())?;
                if !peer_active {
                    active = false;
                    break;
                }
                if coordinator.exists(&peer.log_pointer(&self.replica_name))? {
                    break;
                }
                watch.wait_timeout(PEER_ACK_POLL).await;
            }

            if active {
                source_replica = replica.clone();
            }
        }

        info!(mirror = %source_replica, "will mimic replica");
        let source = self.paths.replica(&source_replica);

        // The order of the next three steps matters: queue entries may be
        // duplicated, but must not be lost.
        for replica in &replicas {
            if let Some(pointer) = coordinator.try_get(&source.log_pointer(replica))? {
                coordinator.create(
                    &self.my_paths.log_pointer(replica),
                    &pointer,
                    CreateMode::Persistent,
                )?;
            }
        }

        let mut source_queue = Vec::new();
        for entry_name in coordinator.children(&source.queue())? {
            if let Some(entry) = coordinator.try_get(&source.queue_entry(&entry_name))? {
                source_queue.push(entry);
            }
        }

        let mut active_parts = ActivePartSet::new();
        for part in coordinator.children(&source.parts())? {
            active_parts.add(part.parse()?);
        }
        let active_parts = active_parts.parts();
        for name in &active_parts {
            let entry = LogEntry::Get {
                source_replica: String::new(),
                new_part_name: name.to_string(),
            };
            coordinator.create(
                &self.my_paths.queue_prefix(),
                &entry.to_text(),
                CreateMode::PersistentSequential,
            )?;
        }
        debug!(count = active_parts.len(), "queued parts to be fetched");

        for entry in &source_queue {
            coordinator.create(
                &self.my_paths.queue_prefix(),
                entry,
                CreateMode::PersistentSequential,
            )?;
        }
        debug!(count = source_queue.len(), "copied queue entries");

        Ok(())
    }

    /// Reconcile local parts with the coordinator's record of this
    /// replica on attach.
    pub(crate) fn check_parts(&self, coordinator: &Coordinator) -> Result<()> {
        let mut expected: BTreeSet<String> = coordinator
            .children(&self.my_paths.parts())?
            .into_iter()
            .collect();

        // Local parts the coordinator doesn't know about.
        let mut unexpected: Vec<Arc<PartMeta>> = Vec::new();
        for part in self.store.parts() {
            if !expected.remove(&part.name.to_string()) {
                unexpected.push(part);
            }
        }

        // Expected parts we don't have by exact name: adopt a local
        // covering part when one exists, otherwise fetch.
        let mut parts_to_add: Vec<Arc<PartMeta>> = Vec::new();
        let mut parts_to_fetch: Vec<String> = Vec::new();
        for missing in expected.clone() {
            let name: PartName = missing.parse()?;
            match self.store.containing_part(&name) {
                Some(containing) => {
                    error!(
                        missing = %missing,
                        covering = %containing.name,
                        "ignoring missing local part because a covering part exists"
                    );
                    if let Some(position) = unexpected
                        .iter()
                        .position(|part| part.name == containing.name)
                    {
                        parts_to_add.push(unexpected.swap_remove(position));
                    }
                }
                None => parts_to_fetch.push(missing),
            }
        }
        for name in &parts_to_fetch {
            expected.remove(name);
        }

        let mut skip_sanity_check = false;
        if coordinator.exists(&self.my_paths.force_restore_flag())? {
            skip_sanity_check = true;
            coordinator.remove(&self.my_paths.force_restore_flag())?;
        }

        let sanity_report = format!(
            "There are {} unexpected parts, {} unexpectedly merged parts, \
             {} unexpectedly obsolete parts, {} missing parts",
            unexpected.len(),
            parts_to_add.len(),
            expected.len(),
            parts_to_fetch.len()
        );
        let insane = parts_to_add.len() > 2
            || unexpected.len() > 2
            || expected.len() > 20
            || parts_to_fetch.len() > 2;

        if skip_sanity_check {
            warn!(flag = %self.my_paths.force_restore_flag(), "{sanity_report}. Skipping the limits on severity of changes to data parts");
        } else if insane {
            return Err(Error::TooManyUnexpectedParts(sanity_report));
        }

        // Register the local parts covering what the coordinator expects.
        for part in &parts_to_add {
            error!(part = %part.name, "adding unexpected local part to coordinator");
            let ops = self.check_part_and_add_ops(coordinator, part)?;
            coordinator.multi(ops)?;
        }

        // Drop the registrations covered by the parts just added.
        for name in &expected {
            error!(part = %name, "removing unexpectedly merged local part from coordinator");
            coordinator.multi(vec![
                Op::remove(self.my_paths.part_checksums(name)),
                Op::remove(self.my_paths.part(name)),
            ])?;
        }

        // Queue a fetch for truly missing parts, atomically with removing
        // the stale registration.
        for name in &parts_to_fetch {
            error!(part = %name, "removing missing part from coordinator and queueing a fetch");
            let entry = LogEntry::Get {
                source_replica: String::new(),
                new_part_name: name.clone(),
            };
            coordinator.multi(vec![
                Op::remove(self.my_paths.part_checksums(name)),
                Op::remove(self.my_paths.part(name)),
                Op::create(
                    self.my_paths.queue_prefix(),
                    entry.to_text(),
                    CreateMode::PersistentSequential,
                ),
            ])?;
        }

        // Put unknown local parts aside instead of deleting them.
        for part in &unexpected {
            let name = part.name.to_string();
            error!(part = %name, "renaming unexpected part");
            self.store.rename_and_detach(&name, "ignored_")?;
        }

        Ok(())
    }
}

fn create_with_ancestors(coordinator: &Coordinator, path: &str) -> Result<()> {
    let mut current = String::new();
    for component in path.split('/').filter(|component| !component.is_empty()) {
        current.push('/');
        current.push_str(component);
        match coordinator.create(&current, "", CreateMode::Persistent) {
            Ok(_) => {}
            Err(Error::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
