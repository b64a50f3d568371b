//! Abandonable Block-Number Locks
//!
//! An insert reserves the next block number of its month partition by
//! creating a persistent sequential `block-NNNNNNNNNN` node whose value
//! points at an ephemeral holder under `temp/`. A committed insert
//! removes both nodes; a crashed insert leaves the number node behind
//! with a dead holder, which reads as `Abandoned`. The merge selector
//! only merges across gap numbers in the abandoned state.

use tracing::debug;

use crate::coordinator::{paths, Coordinator, CreateMode, Op};
use crate::error::Result;

/// Observed state of a reserved block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No number node: never reserved, or committed and removed.
    Unlocked,
    /// The reserving session is still alive.
    Locked,
    /// The reserving session died before committing.
    Abandoned,
}

/// A held block-number reservation.
pub struct AbandonableLock {
    coordinator: Coordinator,
    number: u64,
    number_path: String,
    holder_path: String,
    released: bool,
}

impl AbandonableLock {
    /// Reserve the next block number under `numbers_path`, holding it
    /// through an ephemeral node under `temp_path`.
    pub fn acquire(
        coordinator: &Coordinator,
        temp_path: &str,
        numbers_path: &str,
    ) -> Result<Self> {
        let holder_path = coordinator.create(
            &format!("{temp_path}/block_lock-"),
            "",
            CreateMode::EphemeralSequential,
        )?;
        let number_path = coordinator.create(
            &format!("{numbers_path}/block-"),
            &holder_path,
            CreateMode::PersistentSequential,
        )?;
        let name = number_path.rsplit('/').next().unwrap_or_default();
        let number = paths::sequential_index(name, "block-")?;

        Ok(Self {
            coordinator: coordinator.clone(),
            number,
            number_path,
            holder_path,
            released: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Operations that release the reservation as committed; meant to be
    /// appended to the insert's registration multi. Call
    /// [`Self::mark_released`] once that multi succeeds.
    pub fn unlock_ops(&self) -> Vec<Op> {
        vec![
            Op::remove(self.number_path.clone()),
            Op::remove(self.holder_path.clone()),
        ]
    }

    pub fn mark_released(&mut self) {
        self.released = true;
    }

    /// Release the reservation as abandoned: the number stays behind with
    /// no live holder, so merges may later skip over it.
    pub fn abandon(&mut self) -> Result<()> {
        self.coordinator.try_remove(&self.holder_path)?;
        self.released = true;
        Ok(())
    }

    /// Inspect the state of a number node.
    pub fn check(coordinator: &Coordinator, number_path: &str) -> Result<LockState> {
        match coordinator.try_get(number_path)? {
            None => Ok(LockState::Unlocked),
            Some(holder_path) => {
                if coordinator.exists(&holder_path)? {
                    Ok(LockState::Locked)
                } else {
                    Ok(LockState::Abandoned)
                }
            }
        }
    }
}

impl Drop for AbandonableLock {
    fn drop(&mut self) {
        if !self.released {
            debug!(number = self.number, "abandoning block number reservation");
            if let Err(err) = self.coordinator.try_remove(&self.holder_path) {
                debug!(error = %err, "failed to abandon block number reservation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorService;

    fn setup(coordinator: &Coordinator) {
        for path in ["/t", "/t/temp", "/t/block_numbers", "/t/block_numbers/202301"] {
            coordinator.create(path, "", CreateMode::Persistent).unwrap();
        }
    }

    #[test]
    fn test_lock_states() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        setup(&coordinator);

        let numbers = "/t/block_numbers/202301";
        let mut lock = AbandonableLock::acquire(&coordinator, "/t/temp", numbers).unwrap();
        assert_eq!(lock.number(), 0);

        let number_path = format!("{numbers}/block-0000000000");
        assert_eq!(
            AbandonableLock::check(&coordinator, &number_path).unwrap(),
            LockState::Locked
        );

        lock.abandon().unwrap();
        assert_eq!(
            AbandonableLock::check(&coordinator, &number_path).unwrap(),
            LockState::Abandoned
        );

        coordinator.try_remove(&number_path).unwrap();
        assert_eq!(
            AbandonableLock::check(&coordinator, &number_path).unwrap(),
            LockState::Unlocked
        );
    }

    #[test]
    fn test_commit_removes_both_nodes() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        setup(&coordinator);

        let numbers = "/t/block_numbers/202301";
        let mut lock = AbandonableLock::acquire(&coordinator, "/t/temp", numbers).unwrap();
        coordinator.multi(lock.unlock_ops()).unwrap();
        lock.mark_released();

        assert!(coordinator.children(numbers).unwrap().is_empty());
        assert!(coordinator.children("/t/temp").unwrap().is_empty());
    }

    #[test]
    fn test_session_death_leaves_abandoned_number() {
        let service = CoordinatorService::new();
        let coordinator = service.connect();
        setup(&coordinator);

        let numbers = "/t/block_numbers/202301";
        let lock = AbandonableLock::acquire(&coordinator, "/t/temp", numbers).unwrap();
        std::mem::forget(lock);
        service.expire_session(coordinator.session_id());

        let observer = service.connect();
        assert_eq!(
            AbandonableLock::check(&observer, &format!("{numbers}/block-0000000000")).unwrap(),
            LockState::Abandoned
        );
    }
}
