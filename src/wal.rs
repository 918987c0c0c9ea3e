use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Encode one transaction's records as a single [len][bincode][crc32] entry.
fn encode_entry(writer: &mut impl Write, records: &[Record]) -> io::Result<()> {
    let payload =
        bincode::serialize(records).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Record>][u32: crc32]`
/// - One entry per transaction: a multi-record commit is framed as a single
///   checksummed payload, so replay applies it in full or not at all.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated trailing entry (crash) fails the length or CRC check and is
///   discarded whole, records and all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one transaction to the WAL and fsync. Used by tests only —
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, records: &[Record]) -> io::Result<()> {
        self.append_buffered(records)?;
        self.flush_sync()
    }

    /// Append one transaction to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered
    /// transactions.
    pub fn append_buffered(&mut self, records: &[Record]) -> io::Result<()> {
        encode_entry(&mut self.writer, records)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync. Each record is its
    /// own entry; the atomic rename in `swap_compact_file` is what makes the
    /// snapshot all-or-nothing.
    /// This is the slow I/O phase — call OUTSIDE the WAL lock.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_entry(&mut writer, std::slice::from_ref(record))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    /// This is fast — call while holding the WAL lock.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of records that recreates the current state.
    /// Convenience method that does both phases. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all records from valid entries in
    /// order. Truncated/corrupt trailing entries are silently discarded —
    /// each entry is one transaction, so a torn entry drops the whole
    /// transaction, never a prefix of it.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<Vec<Record>>(&payload) {
                Ok(transaction) => records.extend(transaction),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("roster_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let records = vec![
            Record::ResourceCreated {
                id: rid,
                name: "Conference Room A".into(),
                kind: "Room".into(),
            },
            Record::EventScheduled {
                id: Ulid::new(),
                title: "Team Meeting".into(),
                span: Span::new(1000, 2000),
                description: None,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(std::slice::from_ref(r)).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed, records);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_record_transaction_replays_in_order() {
        let path = tmp_path("multi_record_txn.wal");
        let _ = fs::remove_file(&path);

        let eid = Ulid::new();
        let transaction = vec![
            Record::EventScheduled {
                id: eid,
                title: "Offsite".into(),
                span: Span::new(1000, 2000),
                description: None,
            },
            Record::AllocationAdded {
                id: Ulid::new(),
                event_id: eid,
                resource_id: Ulid::new(),
                span: Span::new(1000, 2000),
            },
            Record::AllocationAdded {
                id: Ulid::new(),
                event_id: eid,
                resource_id: Ulid::new(),
                span: Span::new(1000, 2000),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&transaction).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, transaction);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let record = Record::ResourceCreated {
            id: Ulid::new(),
            name: "Projector 1".into(),
            kind: "Equipment".into(),
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(std::slice::from_ref(&record)).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], record);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_transaction_whole() {
        let path = tmp_path("torn_transaction.wal");
        let _ = fs::remove_file(&path);

        let complete = Record::ResourceCreated {
            id: Ulid::new(),
            name: "Room A".into(),
            kind: "Room".into(),
        };
        let eid = Ulid::new();
        let interrupted = vec![
            Record::EventScheduled {
                id: eid,
                title: "Workshop".into(),
                span: Span::new(1000, 2000),
                description: None,
            },
            Record::AllocationAdded {
                id: Ulid::new(),
                event_id: eid,
                resource_id: Ulid::new(),
                span: Span::new(1000, 2000),
            },
            Record::AllocationAdded {
                id: Ulid::new(),
                event_id: eid,
                resource_id: Ulid::new(),
                span: Span::new(1000, 2000),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(std::slice::from_ref(&complete)).unwrap();
        }

        // Write the multi-record transaction cut short, as a crash mid-flush
        // would leave it.
        {
            let mut entry = Vec::new();
            encode_entry(&mut entry, &interrupted).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&entry[..entry.len() - 5]).unwrap();
        }

        // Nothing from the torn transaction survives — not even its first
        // record.
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![complete]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let transaction = vec![Record::ResourceDeleted { id: Ulid::new() }];

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&transaction).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let eid = Ulid::new();

        // Write many records: create resource, schedule + delete events repeatedly
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&[Record::ResourceCreated {
                id: rid,
                name: "Lab 101".into(),
                kind: "Room".into(),
            }])
            .unwrap();
            wal.append(&[Record::EventScheduled {
                id: eid,
                title: "Workshop".into(),
                span: Span::new(0, 1000),
                description: None,
            }])
            .unwrap();
            wal.append(&[Record::EventDeleted { id: eid }]).unwrap();
            // 10 more churn records
            for _ in 0..10 {
                let tmp_id = Ulid::new();
                wal.append(&[Record::EventScheduled {
                    id: tmp_id,
                    title: "Churn".into(),
                    span: Span::new(0, 500),
                    description: None,
                }])
                .unwrap();
                wal.append(&[Record::EventDeleted { id: tmp_id }]).unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the resource (no events)
        let compacted = vec![Record::ResourceCreated {
            id: rid,
            name: "Lab 101".into(),
            kind: "Room".into(),
        }];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        // Replay should produce just the one record
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed, compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let compacted = vec![Record::ResourceCreated {
            id: rid,
            name: "Room B".into(),
            kind: "Room".into(),
        }];

        let new_record = Record::EventScheduled {
            id: Ulid::new(),
            title: "Sync".into(),
            span: Span::new(1000, 2000),
            description: None,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            // Seed some data
            wal.append(&compacted).unwrap();
            // Compact
            wal.compact(&compacted).unwrap();
            // Append new record after compaction
            wal.append(std::slice::from_ref(&new_record)).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_record);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let records: Vec<Record> = (0..5)
            .map(|i| Record::ResourceCreated {
                id: Ulid::new(),
                name: format!("Room {i}"),
                kind: "Room".into(),
            })
            .collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            // Two transactions, one flush
            wal.append_buffered(&records[..3]).unwrap();
            wal.append_buffered(&records[3..]).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);

        let _ = fs::remove_file(&path);
    }
}
