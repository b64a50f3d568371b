//! Log Entry Types
//!
//! Entries of the replicated operation log and of the per-replica queue,
//! persisted in a human-readable framed text format (version 1):
//!
//! ```text
//! format version: 1
//! source replica: <name or empty>
//! <get|merge>
//! <part name>        ; get: the part to obtain; merge: first input
//! ...                ; (merge only) further inputs
//! into               ; (merge only)
//! <new part name>    ; (merge only)
//! ```

use crate::error::{Error, Result};

/// One replicated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Obtain a part, by fetching it from a replica that has it.
    Get {
        source_replica: String,
        new_part_name: String,
    },
    /// Merge the named parts into a new one, or fetch the result if the
    /// inputs are not available locally.
    Merge {
        source_replica: String,
        parts_to_merge: Vec<String>,
        new_part_name: String,
    },
}

impl LogEntry {
    /// The part this entry produces.
    pub fn new_part_name(&self) -> &str {
        match self {
            LogEntry::Get { new_part_name, .. } => new_part_name,
            LogEntry::Merge { new_part_name, .. } => new_part_name,
        }
    }

    /// The replica that emitted the entry; empty for entries synthesized
    /// during bootstrap.
    pub fn source_replica(&self) -> &str {
        match self {
            LogEntry::Get { source_replica, .. } => source_replica,
            LogEntry::Merge { source_replica, .. } => source_replica,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, LogEntry::Merge { .. })
    }

    /// Serialize to the version-1 text format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("format version: 1\n");
        out.push_str("source replica: ");
        out.push_str(self.source_replica());
        out.push('\n');
        match self {
            LogEntry::Get { new_part_name, .. } => {
                out.push_str("get\n");
                out.push_str(new_part_name);
                out.push('\n');
            }
            LogEntry::Merge {
                parts_to_merge,
                new_part_name,
                ..
            } => {
                out.push_str("merge\n");
                for part in parts_to_merge {
                    out.push_str(part);
                    out.push('\n');
                }
                out.push_str("into\n");
                out.push_str(new_part_name);
                out.push('\n');
            }
        }
        out
    }

    /// Parse the version-1 text format.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedLogEntry(reason.to_string());

        let mut lines = text.lines();
        if lines.next() != Some("format version: 1") {
            return Err(malformed("unexpected format version"));
        }
        let source_replica = lines
            .next()
            .and_then(|line| line.strip_prefix("source replica: "))
            .ok_or_else(|| malformed("missing source replica"))?
            .to_string();

        let entry = match lines.next() {
            Some("get") => {
                let new_part_name = lines
                    .next()
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| malformed("get entry without part name"))?
                    .to_string();
                LogEntry::Get {
                    source_replica,
                    new_part_name,
                }
            }
            Some("merge") => {
                let mut parts_to_merge = Vec::new();
                let new_part_name = loop {
                    match lines.next() {
                        Some("into") => {
                            break lines
                                .next()
                                .filter(|name| !name.is_empty())
                                .ok_or_else(|| malformed("merge entry without result name"))?
                                .to_string();
                        }
                        Some(part) if !part.is_empty() => parts_to_merge.push(part.to_string()),
                        _ => return Err(malformed("merge entry without into separator")),
                    }
                };
                if parts_to_merge.is_empty() {
                    return Err(malformed("merge entry without inputs"));
                }
                LogEntry::Merge {
                    source_replica,
                    parts_to_merge,
                    new_part_name,
                }
            }
            _ => return Err(malformed("unknown entry kind")),
        };

        if lines.any(|line| !line.is_empty()) {
            return Err(malformed("trailing data"));
        }
        Ok(entry)
    }
}

/// A log entry owned by this replica's queue, tagged with the name of its
/// coordinator queue node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub znode_name: String,
    pub entry: LogEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_round_trip() {
        let entry = LogEntry::Get {
            source_replica: "r1".into(),
            new_part_name: "20230101_1_1_0".into(),
        };
        let text = entry.to_text();
        assert_eq!(
            text,
            "format version: 1\nsource replica: r1\nget\n20230101_1_1_0\n"
        );
        assert_eq!(LogEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn test_merge_round_trip() {
        let entry = LogEntry::Merge {
            source_replica: "".into(),
            parts_to_merge: vec!["20230101_1_1_0".into(), "20230101_2_2_0".into()],
            new_part_name: "20230101_1_2_1".into(),
        };
        let parsed = LogEntry::parse(&entry.to_text()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(LogEntry::parse("").is_err());
        assert!(LogEntry::parse("format version: 2\nsource replica: r\nget\np\n").is_err());
        assert!(LogEntry::parse("format version: 1\nsource replica: r\nsteal\np\n").is_err());
        assert!(LogEntry::parse("format version: 1\nsource replica: r\nget\n").is_err());
        // Merge without the into separator.
        assert!(
            LogEntry::parse("format version: 1\nsource replica: r\nmerge\na\nb\n").is_err()
        );
        // Merge without inputs.
        assert!(
            LogEntry::parse("format version: 1\nsource replica: r\nmerge\ninto\nc\n").is_err()
        );
        // Trailing garbage.
        assert!(
            LogEntry::parse("format version: 1\nsource replica: r\nget\np\nextra\n").is_err()
        );
    }
}
