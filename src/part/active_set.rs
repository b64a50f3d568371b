//! Active Part Set
//!
//! A partition-aware set of part names that keeps only the maximal
//! covering subset: adding a part drops every part it covers, and a part
//! already covered by a member is not added. Used both for the set of
//! live on-disk parts and for the virtual parts of the replication queue.

use std::collections::{BTreeMap, BTreeSet};

use crate::part::PartName;

#[derive(Debug, Clone, Default)]
pub struct ActivePartSet {
    by_month: BTreeMap<String, BTreeSet<PartName>>,
}

impl ActivePartSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<'a, I: IntoIterator<Item = &'a PartName>>(names: I) -> Self {
        let mut set = Self::new();
        for name in names {
            set.add(name.clone());
        }
        set
    }

    /// Add a part, keeping the set an antichain under coverage.
    pub fn add(&mut self, name: PartName) {
        let month = self.by_month.entry(name.month().to_string()).or_default();

        if month.iter().any(|existing| existing.covers(&name)) {
            return;
        }
        month.retain(|existing| !name.covers(existing));
        month.insert(name);
    }

    /// Remove an exact member.
    pub fn remove(&mut self, name: &PartName) -> bool {
        match self.by_month.get_mut(name.month()) {
            Some(month) => month.remove(name),
            None => false,
        }
    }

    /// The member covering `name`, if any. Returns `name` itself when it
    /// is a member (every member is its own cover).
    pub fn containing(&self, name: &PartName) -> Option<&PartName> {
        self.by_month
            .get(name.month())?
            .iter()
            .find(|existing| existing.covers(name))
    }

    /// Whether `name` is its own maximal cover: either a member, or not
    /// covered by any member.
    pub fn is_self_maximal(&self, name: &PartName) -> bool {
        match self.containing(name) {
            Some(covering) => covering == name,
            None => true,
        }
    }

    /// All members, ordered by partition and block range.
    pub fn parts(&self) -> Vec<PartName> {
        self.by_month
            .values()
            .flat_map(|month| month.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_month.values().map(|month| month.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PartName {
        s.parse().unwrap()
    }

    #[test]
    fn test_covered_parts_are_dropped() {
        let mut set = ActivePartSet::new();
        set.add(name("20230101_1_1_0"));
        set.add(name("20230101_2_2_0"));
        set.add(name("20230101_1_2_1"));

        assert_eq!(set.parts(), vec![name("20230101_1_2_1")]);
    }

    #[test]
    fn test_adding_covered_part_is_a_no_op() {
        let mut set = ActivePartSet::new();
        set.add(name("20230101_1_4_1"));
        set.add(name("20230101_2_2_0"));

        assert_eq!(set.parts(), vec![name("20230101_1_4_1")]);
    }

    #[test]
    fn test_months_are_independent() {
        let mut set = ActivePartSet::new();
        set.add(name("20230101_1_2_1"));
        set.add(name("20230201_1_1_0"));

        assert_eq!(set.len(), 2);
        assert_eq!(
            set.containing(&name("20230201_1_1_0")),
            Some(&name("20230201_1_1_0"))
        );
        assert!(set.containing(&name("20230301_1_1_0")).is_none());
    }

    // For any input set, the result is an antichain under coverage and
    // every input name is covered by some member.
    #[test]
    fn test_active_set_is_a_covering_antichain() {
        let inputs: Vec<PartName> = [
            "20230101_1_1_0",
            "20230101_2_2_0",
            "20230101_1_2_1",
            "20230101_3_3_0",
            "20230101_1_4_2",
            "20230102_5_5_0",
            "20230201_1_1_0",
            "20230201_2_3_1",
        ]
        .iter()
        .map(|s| name(s))
        .collect();

        let set = ActivePartSet::from_names(&inputs);
        let members = set.parts();

        for a in &members {
            for b in &members {
                assert!(a == b || !a.covers(b), "{} covers member {}", a, b);
            }
        }
        for input in &inputs {
            assert!(
                members.iter().any(|m| m.covers(input)),
                "{} is not covered",
                input
            );
        }
    }

    #[test]
    fn test_is_self_maximal() {
        let mut set = ActivePartSet::new();
        set.add(name("20230101_1_2_1"));

        assert!(set.is_self_maximal(&name("20230101_1_2_1")));
        assert!(!set.is_self_maximal(&name("20230101_1_1_0")));
        // Unknown to the set, nothing covers it.
        assert!(set.is_self_maximal(&name("20230101_7_7_0")));
    }
}
