//! Part Checksums
//!
//! Per-file size and crc32 of a data part, round-trippable through the
//! text format stored in the coordinator under `parts/<name>/checksums`.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Checksum of a single file inside a part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChecksum {
    pub size: u64,
    pub crc: u32,
}

/// Checksums of every file of a part
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksums {
    files: BTreeMap<String, FileChecksum>,
}

impl Checksums {
    pub fn add(&mut self, file: impl Into<String>, data: &[u8]) {
        self.files.insert(
            file.into(),
            FileChecksum {
                size: data.len() as u64,
                crc: crc32fast::hash(data),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Serialize to the text format stored in the coordinator.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("checksums format version: 1\n");
        for (file, sum) in &self.files {
            out.push_str(&format!("{} {} {:08x}\n", file, sum.size, sum.crc));
        }
        out
    }

    /// Parse the text format produced by `to_text`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        if lines.next() != Some("checksums format version: 1") {
            return Err(Error::MalformedChecksums(
                "unexpected checksums format version".into(),
            ));
        }

        let mut files = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split(' ');
            let (Some(file), Some(size), Some(crc), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::MalformedChecksums(line.to_string()));
            };
            let size: u64 = size
                .parse()
                .map_err(|_| Error::MalformedChecksums(line.to_string()))?;
            let crc = u32::from_str_radix(crc, 16)
                .map_err(|_| Error::MalformedChecksums(line.to_string()))?;
            files.insert(file.to_string(), FileChecksum { size, crc });
        }

        Ok(Checksums { files })
    }

    /// Compare against another checksum set. With `strict`, the file sets
    /// must be identical; otherwise only files present in both are
    /// compared.
    pub fn check_equal(&self, other: &Checksums, part: &str, strict: bool) -> Result<()> {
        let mismatch = |reason: String| Error::ChecksumMismatch {
            part: part.to_string(),
            reason,
        };

        for (file, sum) in &self.files {
            match other.files.get(file) {
                Some(other_sum) if other_sum == sum => {}
                Some(other_sum) => {
                    return Err(mismatch(format!(
                        "file {} differs: {} bytes crc {:08x} vs {} bytes crc {:08x}",
                        file, sum.size, sum.crc, other_sum.size, other_sum.crc
                    )))
                }
                None if strict => return Err(mismatch(format!("file {} is missing", file))),
                None => {}
            }
        }
        if strict {
            for file in other.files.keys() {
                if !self.files.contains_key(file) {
                    return Err(mismatch(format!("unexpected file {}", file)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checksums {
        let mut checksums = Checksums::default();
        checksums.add("data.bin", b"hello world");
        checksums.add("count.txt", b"1");
        checksums
    }

    #[test]
    fn test_text_round_trip() {
        let checksums = sample();
        let parsed = Checksums::parse(&checksums.to_text()).unwrap();
        assert_eq!(parsed, checksums);
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        assert!(Checksums::parse("checksums format version: 2\n").is_err());
    }

    #[test]
    fn test_check_equal() {
        let a = sample();
        let mut b = sample();
        a.check_equal(&b, "p", true).unwrap();

        b.add("data.bin", b"other payload");
        assert!(a.check_equal(&b, "p", false).is_err());

        let mut partial = Checksums::default();
        partial.add("data.bin", b"hello world");
        a.check_equal(&partial, "p", false).unwrap();
        assert!(a.check_equal(&partial, "p", true).is_err());
    }
}
