mod error;
mod lifecycle;
mod mutations;
mod overlap;
mod queries;
mod store;
mod sweep;

pub use error::{EngineError, ErrorKind};
pub use lifecycle::Redeemed;
pub use overlap::{BatchRequest, day_candidates};

pub(crate) use lifecycle::{AnswerCheck, validate_answers};
pub(crate) use store::Txn;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{self, Notification, Notifier};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
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
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Every record gets its own answer: a record that fails to encode is refused alone,
/// and a failed flush refuses every record of the batch (the WAL rolls them back).
fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let mut results: Vec<io::Result<()>> = batch
        .iter()
        .map(|(record, _)| wal.append_buffered(record))
        .collect();
    if let Err(e) = wal.flush_sync() {
        for result in results.iter_mut().filter(|r| r.is_ok()) {
            *result = Err(io::Error::new(e.kind(), e.to_string()));
        }
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for ((_, tx), result) in batch.drain(..).zip(results) {
        let _ = tx.send(result);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Lookup tables derived from resource state; rebuilt by replay.
#[derive(Default)]
pub(super) struct Indexes {
    /// window id → resource id
    pub(super) window_to_resource: DashMap<Ulid, Ulid>,
    /// (lowercased claimant, date) → windows with a live or completed claim
    pub(super) claims_per_day: DashMap<(String, NaiveDate), HashSet<Ulid>>,
}

impl Indexes {
    fn add_claim(&self, claimant: &str, date: NaiveDate, window_id: Ulid) {
        self.claims_per_day
            .entry((claimant.to_lowercase(), date))
            .or_default()
            .insert(window_id);
    }

    fn drop_claim(&self, claimant: &str, date: NaiveDate, window_id: &Ulid) {
        if let Some(mut ids) = self.claims_per_day.get_mut(&(claimant.to_lowercase(), date)) {
            ids.remove(window_id);
        }
    }
}

pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) indexes: Indexes,
    /// token digest → token record
    pub(super) tokens: DashMap<String, ActionToken>,
    /// Commits hold it shared; compaction holds it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply an event directly to a ResourceState (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, indexes: &Indexes) {
    match event {
        Event::ManagerAssigned { identity, .. } => {
            rs.managers.insert(identity.clone());
        }
        Event::ManagerRevoked { identity, .. } => {
            rs.managers.remove(identity);
        }
        Event::QuestionAdded { question, .. } => {
            rs.questions.retain(|q| q.id != question.id);
            rs.questions.push(question.clone());
        }
        Event::QuestionRemoved { question_id, .. } => {
            rs.questions.retain(|q| q.id != *question_id);
        }
        Event::WindowCreated {
            resource_id,
            window,
        } => {
            indexes.window_to_resource.insert(window.id, *resource_id);
            if let Some(claim) = window.claim_info()
                && counts_toward_daily_limit(window.status)
            {
                indexes.add_claim(&claim.claimant, window.date, window.id);
            }
            rs.insert_window(window.clone());
        }
        Event::WindowClaimed {
            window_id, claim, ..
        } => {
            if let Some(window) = rs.window_mut(window_id) {
                window.claim(claim.clone());
                indexes.add_claim(&claim.claimant, window.date, window.id);
            }
        }
        Event::AnswersRecorded {
            window_id, answers, ..
        } => {
            rs.answers.insert(*window_id, answers.clone());
        }
        Event::StatusChanged {
            window_id, status, ..
        } => {
            if let Some(window) = rs.window_mut(window_id) {
                window.status = *status;
                if !counts_toward_daily_limit(*status)
                    && let Some(claim) = window.claim_info()
                {
                    indexes.drop_claim(&claim.claimant, window.date, window_id);
                }
            }
        }
        // ResourceCreated is handled at the DashMap level, tokens at the engine level
        Event::ResourceCreated { .. } | Event::TokenIssued { .. } | Event::TokenConsumed { .. } => {}
    }
}

fn apply_token_event(tokens: &DashMap<String, ActionToken>, event: &Event) {
    match event {
        Event::TokenIssued { digest, token } => {
            tokens.insert(digest.clone(), token.clone());
        }
        Event::TokenConsumed { digest } => {
            if let Some(mut token) = tokens.get_mut(digest) {
                token.used = true;
            }
        }
        _ => {}
    }
}

/// Claims in these states occupy the claimant's daily quota.
pub(crate) fn counts_toward_daily_limit(status: WindowStatus) -> bool {
    matches!(
        status,
        WindowStatus::Pending | WindowStatus::Approved | WindowStatus::Completed
    )
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            indexes: Indexes::default(),
            tokens: DashMap::new(),
            commit_gate: RwLock::new(()),
            notifier,
            clock,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds instantly.
        // Never use blocking_write here because this may run inside an async context.
        for event in records.iter().flatten() {
            match event {
                Event::ResourceCreated { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::TokenIssued { .. } | Event::TokenConsumed { .. } => {
                    apply_token_event(&engine.tokens, event);
                }
                other => {
                    if let Some(resource_id) = other.resource_id()
                        && let Some(entry) = engine.get_resource(&resource_id)
                        && let Ok(mut guard) = entry.try_write()
                    {
                        apply_to_resource(&mut guard, other, &engine.indexes);
                    }
                }
            }
        }

        tracing::info!(
            resources = engine.state.len(),
            tokens = engine.tokens.len(),
            "engine state replayed"
        );
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, record: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_window(&self, window_id: &Ulid) -> Option<Ulid> {
        self.indexes
            .window_to_resource
            .get(window_id)
            .map(|e| *e.value())
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Open a transaction holding the write locks of `resource_ids`, taken in sorted order.
    pub(crate) async fn begin(&self, resource_ids: &[Ulid]) -> Result<Txn<'_>, EngineError> {
        let mut ids = resource_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(Txn::new(self, guards))
    }

    /// Lookup window → resource, then open a transaction on that resource.
    pub(crate) async fn begin_for_window(
        &self,
        window_id: &Ulid,
    ) -> Result<(Txn<'_>, Ulid), EngineError> {
        let resource_id = self
            .get_resource_for_window(window_id)
            .ok_or(EngineError::NotFound(*window_id))?;
        let txn = self.begin(&[resource_id]).await?;
        Ok((txn, resource_id))
    }

    pub(crate) fn notify(&self, notification: Notification) {
        notify::dispatch(self.notifier.clone(), notification);
    }
}
