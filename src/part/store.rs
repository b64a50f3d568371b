//! Local Part Store
//!
//! On-disk storage for data parts. Each part is a directory named after
//! the part holding the payload (`data.bin`), the row count (`count.txt`)
//! and the part checksums (`checksums.txt`). New parts are written under
//! a `tmp_` prefix and activated with an atomic rename; parts replaced by
//! a covering part are retired and reaped later by the housekeeper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::part::{ActivePartSet, Checksums, PartName};

const DATA_FILE: &str = "data.bin";
const COUNT_FILE: &str = "count.txt";
const CHECKSUMS_FILE: &str = "checksums.txt";
const TMP_PREFIX: &str = "tmp_";

/// Metadata of one stored part
#[derive(Debug, Clone)]
pub struct PartMeta {
    pub name: PartName,
    pub rows: u64,
    pub checksums: Checksums,
}

impl PartMeta {
    /// Approximate size in index marks.
    pub fn marks(&self, index_granularity: u64) -> u64 {
        self.rows.div_ceil(index_granularity.max(1))
    }
}

/// A part written to a temporary directory, not yet visible.
#[derive(Debug)]
pub struct TempPart {
    pub meta: PartMeta,
    dir: PathBuf,
}

struct StoreState {
    active: BTreeMap<String, Arc<PartMeta>>,
    active_set: ActivePartSet,
    retired: Vec<(String, Instant)>,
}

/// The local store of data parts for one table replica.
pub struct PartStore {
    dir: PathBuf,
    old_parts_lifetime: Duration,
    state: Mutex<StoreState>,
    merges_cancelled: AtomicBool,
}

impl PartStore {
    /// Open a store, scanning existing part directories. Leftover `tmp_`
    /// directories from interrupted writes are removed; `ignored_`
    /// directories (detached parts) are left untouched.
    pub fn open(dir: impl Into<PathBuf>, old_parts_lifetime: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut loaded: Vec<Arc<PartMeta>> = Vec::new();
        for dir_entry in std::fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(TMP_PREFIX) {
                warn!(part = %file_name, "removing leftover temporary part");
                std::fs::remove_dir_all(dir_entry.path())?;
                continue;
            }
            if file_name.starts_with("ignored_") {
                continue;
            }
            let name: PartName = match file_name.parse() {
                Ok(name) => name,
                Err(_) => {
                    warn!(entry = %file_name, "skipping unrecognized directory in part store");
                    continue;
                }
            };
            loaded.push(Arc::new(load_part_meta(&dir_entry.path(), name)?));
        }

        let mut active_set = ActivePartSet::new();
        for meta in &loaded {
            active_set.add(meta.name.clone());
        }

        let mut active = BTreeMap::new();
        let mut retired = Vec::new();
        let now = Instant::now();
        for meta in loaded {
            if active_set.is_self_maximal(&meta.name) {
                active.insert(meta.name.to_string(), meta);
            } else {
                debug!(part = %meta.name, "part is covered on disk, scheduling removal");
                retired.push((meta.name.to_string(), now));
            }
        }

        Ok(Self {
            dir,
            old_parts_lifetime,
            state: Mutex::new(StoreState {
                active,
                active_set,
                retired,
            }),
            merges_cancelled: AtomicBool::new(false),
        })
    }

    /// All active parts, ordered by partition and block range.
    pub fn parts(&self) -> Vec<Arc<PartMeta>> {
        let state = self.state.lock().unwrap();
        state
            .active_set
            .parts()
            .iter()
            .filter_map(|name| state.active.get(&name.to_string()).cloned())
            .collect()
    }

    /// The active part with exactly this name.
    pub fn get_part(&self, name: &str) -> Option<Arc<PartMeta>> {
        self.state.lock().unwrap().active.get(name).cloned()
    }

    /// The active part covering `name`, if any.
    pub fn containing_part(&self, name: &PartName) -> Option<Arc<PartMeta>> {
        let state = self.state.lock().unwrap();
        let covering = state.active_set.containing(name)?.to_string();
        state.active.get(&covering).cloned()
    }

    /// Read the payload of an active part.
    pub fn read_payload(&self, name: &str) -> Result<Vec<u8>> {
        if self.get_part(name).is_none() {
            return Err(Error::PartNotFound(name.to_string()));
        }
        Ok(std::fs::read(self.dir.join(name).join(DATA_FILE))?)
    }

    /// Write a new part under a temporary name.
    pub fn write_temp(&self, name: &PartName, payload: &[u8], rows: u64) -> Result<TempPart> {
        let count = rows.to_string();
        let mut checksums = Checksums::default();
        checksums.add(DATA_FILE, payload);
        checksums.add(COUNT_FILE, count.as_bytes());

        let tmp_dir = self.dir.join(format!("{}{}", TMP_PREFIX, name));
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir_all(&tmp_dir)?;
        std::fs::write(tmp_dir.join(DATA_FILE), payload)?;
        std::fs::write(tmp_dir.join(COUNT_FILE), count)?;
        std::fs::write(tmp_dir.join(CHECKSUMS_FILE), checksums.to_text())?;

        Ok(TempPart {
            meta: PartMeta {
                name: name.clone(),
                rows,
                checksums,
            },
            dir: tmp_dir,
        })
    }

    /// Activate a temporary part: rename it into place, retire every
    /// active part it covers and return their names.
    pub fn rename_temp_and_replace(&self, temp: TempPart) -> Result<(Arc<PartMeta>, Vec<String>)> {
        let final_dir = self.dir.join(temp.meta.name.to_string());
        if final_dir.exists() {
            std::fs::remove_dir_all(&final_dir)?;
        }
        std::fs::rename(&temp.dir, &final_dir)?;

        let meta = Arc::new(temp.meta);
        let mut state = self.state.lock().unwrap();
        let replaced: Vec<String> = state
            .active_set
            .parts()
            .iter()
            .filter(|existing| meta.name.covers(existing) && **existing != meta.name)
            .map(|existing| existing.to_string())
            .collect();

        let now = Instant::now();
        for name in &replaced {
            state.active.remove(name);
            state.retired.push((name.clone(), now));
        }
        state.active_set.add(meta.name.clone());
        state.active.insert(meta.name.to_string(), meta.clone());

        Ok((meta, replaced))
    }

    /// Move an active part aside under a name prefix without deleting it.
    pub fn rename_and_detach(&self, name: &str, prefix: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let meta = state
            .active
            .remove(name)
            .ok_or_else(|| Error::PartNotFound(name.to_string()))?;
        state.active_set.remove(&meta.name);
        drop(state);

        std::fs::rename(self.dir.join(name), self.dir.join(format!("{prefix}{name}")))?;
        Ok(())
    }

    /// Remove retired parts older than the configured lifetime and
    /// return their names.
    pub fn clear_old_parts(&self) -> Vec<String> {
        let due: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let lifetime = self.old_parts_lifetime;
            let (due, keep): (Vec<_>, Vec<_>) = state
                .retired
                .drain(..)
                .partition(|(_, retired_at)| now.duration_since(*retired_at) >= lifetime);
            state.retired = keep;
            due.into_iter().map(|(name, _)| name).collect()
        };

        let mut removed = Vec::new();
        for name in due {
            match std::fs::remove_dir_all(self.dir.join(&name)) {
                Ok(()) => removed.push(name),
                Err(err) => warn!(part = %name, error = %err, "failed to remove old part"),
            }
        }
        removed
    }

    /// Merge the payloads of `inputs` into a new temporary part.
    pub fn merge_parts(&self, inputs: &[Arc<PartMeta>], new_name: &PartName) -> Result<TempPart> {
        if self.merges_cancelled.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let mut payload = Vec::new();
        let mut rows = 0;
        for input in inputs {
            payload.extend_from_slice(&self.read_payload(&input.name.to_string())?);
            rows += input.rows;

            if self.merges_cancelled.load(Ordering::SeqCst) {
                return Err(Error::ShuttingDown);
            }
        }
        self.write_temp(new_name, &payload, rows)
    }

    /// Ask in-flight and future merges to abort.
    pub fn cancel_merges(&self) {
        self.merges_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn uncancel_merges(&self) {
        self.merges_cancelled.store(false, Ordering::SeqCst);
    }

    /// Remove all local data, active and retired.
    pub fn drop_all(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.active.clear();
            state.active_set = ActivePartSet::new();
            state.retired.clear();
        }
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn load_part_meta(dir: &Path, name: PartName) -> Result<PartMeta> {
    let payload = std::fs::read(dir.join(DATA_FILE))?;
    let count = std::fs::read_to_string(dir.join(COUNT_FILE))?;
    let rows: u64 = count
        .trim()
        .parse()
        .map_err(|_| Error::Internal(format!("bad row count in part {}", name)))?;

    let stored = Checksums::parse(&std::fs::read_to_string(dir.join(CHECKSUMS_FILE))?)?;
    let mut computed = Checksums::default();
    computed.add(DATA_FILE, &payload);
    computed.add(COUNT_FILE, count.as_bytes());
    stored.check_equal(&computed, &name.to_string(), true)?;

    Ok(PartMeta {
        name,
        rows,
        checksums: stored,
    })
}
