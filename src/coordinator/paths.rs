//! Coordinator Path Layout
//!
//! Pure string composition of every coordinator key used by a replicated
//! table, so the rest of the crate never assembles paths by hand.
//!
//! ```text
//! <root>/metadata
//! <root>/replicas/<r>/{is_active,host,log/…,log_pointers/…,queue/…,parts/…,flags/…}
//! <root>/blocks/<block_id>/{number,checksums}
//! <root>/block_numbers/<month>/block-NNNNNNNNNN
//! <root>/leader_election/
//! <root>/temp/
//! ```

use crate::error::{Error, Result};

/// Width of the numeric suffix of sequential node names.
pub const SEQ_WIDTH: usize = 10;

/// Paths of one table's coordinator subtree.
#[derive(Debug, Clone)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn replicas(&self) -> String {
        format!("{}/replicas", self.root)
    }

    pub fn blocks(&self) -> String {
        format!("{}/blocks", self.root)
    }

    pub fn block(&self, block_id: &str) -> String {
        format!("{}/blocks/{}", self.root, block_id)
    }

    pub fn block_number_field(&self, block_id: &str) -> String {
        format!("{}/blocks/{}/number", self.root, block_id)
    }

    pub fn block_checksums(&self, block_id: &str) -> String {
        format!("{}/blocks/{}/checksums", self.root, block_id)
    }

    pub fn block_numbers(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn block_numbers_month(&self, month: &str) -> String {
        format!("{}/block_numbers/{}", self.root, month)
    }

    pub fn block_number(&self, month: &str, number: u64) -> String {
        format!(
            "{}/block_numbers/{}/block-{:0width$}",
            self.root,
            month,
            number,
            width = SEQ_WIDTH
        )
    }

    pub fn block_number_prefix(&self, month: &str) -> String {
        format!("{}/block_numbers/{}/block-", self.root, month)
    }

    pub fn leader_election(&self) -> String {
        format!("{}/leader_election", self.root)
    }

    pub fn leader_election_prefix(&self) -> String {
        format!("{}/leader_election/leader_election-", self.root)
    }

    pub fn temp(&self) -> String {
        format!("{}/temp", self.root)
    }

    pub fn replica(&self, replica: &str) -> ReplicaPaths {
        ReplicaPaths {
            base: format!("{}/replicas/{}", self.root, replica),
        }
    }
}

/// Paths of one replica's subtree.
#[derive(Debug, Clone)]
pub struct ReplicaPaths {
    base: String,
}

impl ReplicaPaths {
    pub fn root(&self) -> &str {
        &self.base
    }

    pub fn is_active(&self) -> String {
        format!("{}/is_active", self.base)
    }

    pub fn host(&self) -> String {
        format!("{}/host", self.base)
    }

    pub fn log(&self) -> String {
        format!("{}/log", self.base)
    }

    pub fn log_entry(&self, index: u64) -> String {
        format!("{}/log/log-{:0width$}", self.base, index, width = SEQ_WIDTH)
    }

    pub fn log_prefix(&self) -> String {
        format!("{}/log/log-", self.base)
    }

    pub fn log_pointers(&self) -> String {
        format!("{}/log_pointers", self.base)
    }

    pub fn log_pointer(&self, peer: &str) -> String {
        format!("{}/log_pointers/{}", self.base, peer)
    }

    pub fn queue(&self) -> String {
        format!("{}/queue", self.base)
    }

    pub fn queue_entry(&self, znode_name: &str) -> String {
        format!("{}/queue/{}", self.base, znode_name)
    }

    pub fn queue_prefix(&self) -> String {
        format!("{}/queue/queue-", self.base)
    }

    pub fn parts(&self) -> String {
        format!("{}/parts", self.base)
    }

    pub fn part(&self, part_name: &str) -> String {
        format!("{}/parts/{}", self.base, part_name)
    }

    pub fn part_checksums(&self, part_name: &str) -> String {
        format!("{}/parts/{}/checksums", self.base, part_name)
    }

    pub fn flags(&self) -> String {
        format!("{}/flags", self.base)
    }

    pub fn force_restore_flag(&self) -> String {
        format!("{}/flags/force_restore_data", self.base)
    }
}

/// Parse the numeric suffix of a sequential node name like
/// `log-0000000042`.
pub fn sequential_index(name: &str, prefix: &str) -> Result<u64> {
    name.strip_prefix(prefix)
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| Error::Coordinator(format!("bad sequential node name: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = TablePaths::new("/wolftable/hits/");
        assert_eq!(paths.root(), "/wolftable/hits");
        assert_eq!(paths.metadata(), "/wolftable/hits/metadata");
        assert_eq!(
            paths.block_number("202301", 7),
            "/wolftable/hits/block_numbers/202301/block-0000000007"
        );

        let replica = paths.replica("r1");
        assert_eq!(replica.root(), "/wolftable/hits/replicas/r1");
        assert_eq!(replica.log_entry(3), "/wolftable/hits/replicas/r1/log/log-0000000003");
        assert_eq!(replica.log_pointer("r2"), "/wolftable/hits/replicas/r1/log_pointers/r2");
        assert_eq!(
            replica.part_checksums("20230101_1_1_0"),
            "/wolftable/hits/replicas/r1/parts/20230101_1_1_0/checksums"
        );
    }

    #[test]
    fn test_sequential_index() {
        assert_eq!(sequential_index("log-0000000042", "log-").unwrap(), 42);
        assert!(sequential_index("log-x", "log-").is_err());
        assert!(sequential_index("queue-1", "log-").is_err());
    }
}
