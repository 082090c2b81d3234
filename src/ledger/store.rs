//! Append-only JSON Lines storage for ledger entries.

use chrono::Utc;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

use super::entry::{EntityKind, LedgerEntry, Transition};
use super::view::LedgerView;
use crate::errors::LedgerError;

struct FileSink {
    path: PathBuf,
    file: File,
    /// Held for the lifetime of the ledger; dropping it releases the advisory lock.
    _lock: File,
}

struct LedgerInner {
    entries: Vec<LedgerEntry>,
    index: HashMap<(EntityKind, String), Vec<usize>>,
    sink: Option<FileSink>,
}

/// How the ledger file ended when it was read.
enum Tail {
    Clean,
    /// Last entry parsed but lacks its newline.
    Unterminated,
    /// Last line is a partial write; bytes past `valid_len` are garbage.
    Torn { valid_len: u64 },
}

impl LedgerInner {
    fn push(&mut self, entry: LedgerEntry) {
        let pos = self.entries.len();
        self.index
            .entry((entry.entity, entry.entity_id.clone()))
            .or_default()
            .push(pos);
        self.entries.push(entry);
    }
}

/// The durable, totally ordered log of every orchestration transition.
///
/// Cloning a `Ledger` yields another handle to the same log. Appends from
/// any handle are serialized by an internal mutex, which is where the
/// sequence number (and therefore the total order) is assigned.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("len", &self.len()).finish()
    }
}

impl Ledger {
    /// A ledger that lives only in memory. Used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                entries: Vec::new(),
                index: HashMap::new(),
                sink: None,
            })),
        }
    }

    /// Open (or create) the ledger file, taking an exclusive advisory lock.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;
        lock.try_lock_exclusive().map_err(|_| LedgerError::Locked {
            path: path.to_path_buf(),
        })?;

        let (entries, tail) = Self::read_file(path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        match tail {
            Tail::Clean => {}
            Tail::Unterminated => file.write_all(b"\n").map_err(io_err)?,
            Tail::Torn { valid_len } => {
                warn!(
                    path = %path.display(),
                    kept = entries.len(),
                    "dropping torn final ledger line"
                );
                file.set_len(valid_len).map_err(io_err)?;
            }
        }

        let mut inner = LedgerInner {
            entries: Vec::with_capacity(entries.len()),
            index: HashMap::new(),
            sink: Some(FileSink {
                path: path.to_path_buf(),
                file,
                _lock: lock,
            }),
        };
        for entry in entries {
            inner.push(entry);
        }

        debug!(path = %path.display(), entries = inner.entries.len(), "ledger opened");

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Read every entry from a ledger file without locking it.
    ///
    /// Returns an empty list when the file does not exist. Sequence numbers
    /// must start at 1 and be gap-free. An unterminated final line that does
    /// not parse is a torn write and is skipped; any other bad line is fatal.
    pub fn load_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        Self::read_file(path).map(|(entries, _)| entries)
    }

    fn read_file(path: &Path) -> Result<(Vec<LedgerEntry>, Tail), LedgerError> {
        if !path.exists() {
            return Ok((Vec::new(), Tail::Clean));
        }

        let bytes = fs::read(path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        let mut tail = Tail::Clean;
        let mut offset = 0u64;
        for (i, line) in bytes.split_inclusive(|&b| b == b'\n').enumerate() {
            let start = offset;
            offset += line.len() as u64;
            let terminated = line.last() == Some(&b'\n');
            let body = line.trim_ascii();
            if body.is_empty() {
                continue;
            }
            let entry: LedgerEntry = match serde_json::from_slice(body) {
                Ok(entry) => entry,
                Err(e) if !terminated => {
                    debug!(line = i + 1, error = %e, "torn final ledger line");
                    tail = Tail::Torn { valid_len: start };
                    break;
                }
                Err(e) => {
                    return Err(LedgerError::Corrupt {
                        line: i + 1,
                        message: e.to_string(),
                    });
                }
            };
            let expected = entries.len() as u64 + 1;
            if entry.seq != expected {
                return Err(LedgerError::SequenceGap {
                    expected,
                    found: entry.seq,
                });
            }
            if !terminated {
                tail = Tail::Unterminated;
            }
            entries.push(entry);
        }

        Ok((entries, tail))
    }

    /// Append one transition, assigning the next sequence number.
    ///
    /// The entry is flushed and synced before it becomes visible to readers.
    pub fn append(&self, transition: Transition) -> Result<LedgerEntry, LedgerError> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let entry = LedgerEntry {
            seq: inner.entries.len() as u64 + 1,
            timestamp: Utc::now(),
            entity: transition.entity,
            entity_id: transition.entity_id,
            old_status: transition.old_status,
            new_status: transition.new_status,
            actor: transition.actor,
            detail: transition.detail,
        };

        if let Some(sink) = inner.sink.as_mut() {
            let mut line = serde_json::to_string(&entry).map_err(LedgerError::Serialize)?;
            line.push('\n');
            let io_err = |source| LedgerError::Io {
                path: sink.path.clone(),
                source,
            };
            let len = sink.file.metadata().map_err(io_err)?.len();
            let written = sink
                .file
                .write_all(line.as_bytes())
                .and_then(|()| sink.file.flush())
                .and_then(|()| sink.file.sync_data());
            if let Err(source) = written {
                // no partial line may remain for the next append to join
                if let Err(e) = sink.file.set_len(len) {
                    warn!(path = %sink.path.display(), error = %e, "failed to roll back partial ledger write");
                }
                return Err(io_err(source));
            }
        }

        trace!(
            seq = entry.seq,
            entity = %entry.entity,
            id = %entry.entity_id,
            from = entry.old_status.as_deref().unwrap_or("-"),
            to = %entry.new_status,
            "ledger append"
        );

        inner.push(entry.clone());
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry in sequence order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner.entries.clone())
    }

    /// Every entry about one entity, in sequence order.
    pub fn entries_for(
        &self,
        entity: EntityKind,
        id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner
            .index
            .get(&(entity, id.to_string()))
            .map(|positions| positions.iter().map(|&p| inner.entries[p].clone()).collect())
            .unwrap_or_default())
    }

    /// The latest entry about one entity.
    pub fn last_for(
        &self,
        entity: EntityKind,
        id: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(inner
            .index
            .get(&(entity, id.to_string()))
            .and_then(|positions| positions.last())
            .map(|&p| inner.entries[p].clone()))
    }

    /// Fold the whole log into current state.
    pub fn view(&self) -> Result<LedgerView, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        LedgerView::fold(&inner.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitStatus;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_assigns_gap_free_sequence() {
        let ledger = Ledger::in_memory();
        let a = ledger
            .append(Transition::unit("A", None, UnitStatus::Pending))
            .unwrap();
        let b = ledger
            .append(Transition::unit("B", None, UnitStatus::Pending))
            .unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_index_by_entity() {
        let ledger = Ledger::in_memory();
        ledger
            .append(Transition::unit("A", None, UnitStatus::Pending))
            .unwrap();
        ledger
            .append(Transition::unit("B", None, UnitStatus::Pending))
            .unwrap();
        ledger
            .append(Transition::unit(
                "A",
                Some(UnitStatus::Pending),
                UnitStatus::Ready,
            ))
            .unwrap();

        let a = ledger.entries_for(EntityKind::Unit, "A").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].new_status, "ready");
        let last = ledger.last_for(EntityKind::Unit, "B").unwrap().unwrap();
        assert_eq!(last.seq, 2);
        assert!(ledger.last_for(EntityKind::Phase, "A").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .append(Transition::unit("A", None, UnitStatus::Pending))
                .unwrap();
            ledger
                .append(Transition::unit(
                    "A",
                    Some(UnitStatus::Pending),
                    UnitStatus::Ready,
                ))
                .unwrap();
        }

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        let next = ledger
            .append(Transition::unit(
                "A",
                Some(UnitStatus::Ready),
                UnitStatus::Dispatched,
            ))
            .unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(Ledger::load_entries(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let _first = Ledger::open(&path).unwrap();
        let second = Ledger::open(&path);
        assert!(matches!(second, Err(LedgerError::Locked { .. })));
    }

    #[test]
    fn test_load_detects_sequence_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .append(Transition::unit("A", None, UnitStatus::Pending))
                .unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"seq\":1", "\"seq\":2");
        fs::write(&path, tampered).unwrap();

        let err = Ledger::load_entries(&path).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::SequenceGap {
                expected: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn test_load_detects_corrupt_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(
            Ledger::load_entries(&path),
            Err(LedgerError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_open_drops_torn_final_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .append(Transition::unit("A", None, UnitStatus::Pending))
                .unwrap();
            ledger
                .append(Transition::unit(
                    "A",
                    Some(UnitStatus::Pending),
                    UnitStatus::Ready,
                ))
                .unwrap();
        }
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str(r#"{"seq":3,"timestamp":"2026-"#);
        fs::write(&path, raw).unwrap();

        assert_eq!(Ledger::load_entries(&path).unwrap().len(), 2);

        {
            let ledger = Ledger::open(&path).unwrap();
            assert_eq!(ledger.len(), 2);
            let next = ledger
                .append(Transition::unit(
                    "A",
                    Some(UnitStatus::Ready),
                    UnitStatus::Dispatched,
                ))
                .unwrap();
            assert_eq!(next.seq, 3);
        }

        let reloaded = Ledger::load_entries(&path).unwrap();
        assert_eq!(
            reloaded.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(reloaded[2].new_status, "dispatched");
    }

    #[test]
    fn test_open_terminates_unterminated_final_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .append(Transition::unit("A", None, UnitStatus::Pending))
                .unwrap();
        }
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.trim_end()).unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        ledger
            .append(Transition::unit(
                "A",
                Some(UnitStatus::Pending),
                UnitStatus::Ready,
            ))
            .unwrap();
        drop(ledger);

        assert_eq!(Ledger::load_entries(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_line_before_the_end_stays_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        fs::write(&path, "{\"seq\":1,\"timestamp\":\"2026-\n{\"seq\":2").unwrap();
        assert!(matches!(
            Ledger::open(&path),
            Err(LedgerError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        assert!(
            Ledger::load_entries(&dir.path().join("absent.jsonl"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_concurrent_appends_keep_total_order() {
        let ledger = Ledger::in_memory();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger
                            .append(Transition::unit(
                                &format!("u{}-{}", t, i),
                                None,
                                UnitStatus::Pending,
                            ))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 200);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.seq, i as u64 + 1);
        }
    }
}
