mod conflict;
mod error;
mod mutations;
mod queries;
mod report;
mod store;

pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use store::{SharedEventState, SharedResourceState, Store};

use std::io;
use std::path::PathBuf;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One logical transaction: all records land in the WAL together, before
    /// the caller is told Ok.
    Append {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { records, response } => {
                let mut batch = vec![(records, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { records, response }) => {
                            batch.push((records, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type AppendBatch = Vec<(Vec<Record>, oneshot::Sender<io::Result<()>>)>;

fn flush_and_respond(wal: &mut Wal, batch: &mut AppendBatch) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &AppendBatch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (records, _) in batch.iter() {
        // One framed entry per transaction: a crash or short write mid-entry
        // leaves a torn tail that replay discards whole, so no transaction
        // can ever be applied in part.
        if let Err(e) = wal.append_buffered(records) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so buffered bytes don't leak
    // into the next batch. A half-written entry fails its CRC on replay.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut AppendBatch, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub(super) store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this shared across its persist-then-apply
    /// sequence; compaction holds it exclusive, so the snapshot and the WAL
    /// swap never interleave with a commit that is fsynced but not yet
    /// applied to the store.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for record in &records {
            store.replay_record(record);
        }

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Write one transaction's records to the WAL via the background
    /// group-commit writer. Returns only after fsync.
    pub(super) async fn persist(&self, records: Vec<Record>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn persist_one(&self, record: Record) -> Result<(), EngineError> {
        self.persist(vec![record]).await
    }

    // ── WAL compaction ───────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL to the minimal record sequence that recreates the
    /// current state: resources, then events, then allocations. The commit
    /// gate is held exclusive for the whole pass, so no record can land in
    /// the old WAL after the snapshot and then be dropped by the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _quiesced = self.commit_gate.write().await;
        let mut records = Vec::new();

        for id in self.store.resource_ids() {
            if let Some(rs) = self.store.get_resource(&id) {
                let guard = rs.read().await;
                records.push(Record::ResourceCreated {
                    id: guard.id,
                    name: guard.name.clone(),
                    kind: guard.kind.clone(),
                });
            }
        }

        let mut allocation_records = Vec::new();
        for id in self.store.event_ids() {
            if let Some(ev) = self.store.get_event(&id) {
                let guard = ev.read().await;
                records.push(Record::EventScheduled {
                    id: guard.id,
                    title: guard.title.clone(),
                    span: guard.span,
                    description: guard.description.clone(),
                });
                for (alloc_id, resource_id) in &guard.allocations {
                    allocation_records.push(Record::AllocationAdded {
                        id: *alloc_id,
                        event_id: guard.id,
                        resource_id: *resource_id,
                        span: guard.span,
                    });
                }
            }
        }
        records.extend(allocation_records);

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
