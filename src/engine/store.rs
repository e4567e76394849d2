use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand, apply_to_resource, apply_token_event};

/// A unit of work against the store.
///
/// Holds the write locks of every resource it may touch from the first read until
/// commit, so check-then-act sequences are atomic. Staged events are invisible
/// until `commit`, which makes them durable as one WAL record and then applies them.
/// Dropping a `Txn` without committing is a rollback: nothing was applied.
pub(crate) struct Txn<'e> {
    engine: &'e Engine,
    guards: Vec<OwnedRwLockWriteGuard<ResourceState>>,
    staged: Vec<Event>,
}

impl<'e> Txn<'e> {
    pub(super) fn new(engine: &'e Engine, guards: Vec<OwnedRwLockWriteGuard<ResourceState>>) -> Self {
        Self {
            engine,
            guards,
            staged: Vec::new(),
        }
    }

    pub(crate) fn resource(&self, id: &Ulid) -> Result<&ResourceState, EngineError> {
        self.guards
            .iter()
            .find(|g| g.id == *id)
            .map(|g| &**g)
            .ok_or(EngineError::NotFound(*id))
    }

    pub(crate) fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.guards.iter().map(|g| &**g)
    }

    pub(crate) fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub(crate) fn stage_all(&mut self, events: impl IntoIterator<Item = Event>) {
        self.staged.extend(events);
    }

    pub(crate) async fn commit(mut self) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        for event in &self.staged {
            if let Some(rid) = event.resource_id()
                && !matches!(event, Event::ResourceCreated { .. })
                && !self.guards.iter().any(|g| g.id == rid)
            {
                return Err(EngineError::Store(format!(
                    "transaction touches resource {rid} without holding its lock"
                )));
            }
        }

        let record = std::mem::take(&mut self.staged);
        let _gate = self.engine.commit_gate.read().await;
        let commit_start = std::time::Instant::now();
        self.engine.wal_append(record.clone()).await?;

        for event in &record {
            match event {
                Event::ResourceCreated { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    self.engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                    metrics::gauge!(crate::observability::RESOURCES_ACTIVE)
                        .set(self.engine.state.len() as f64);
                }
                Event::TokenIssued { .. } | Event::TokenConsumed { .. } => {
                    apply_token_event(&self.engine.tokens, event);
                }
                other => {
                    if let Some(rid) = other.resource_id()
                        && let Some(guard) = self.guards.iter_mut().find(|g| g.id == rid)
                    {
                        apply_to_resource(guard, other, &self.engine.indexes);
                    }
                }
            }
        }
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS)
            .record(commit_start.elapsed().as_secs_f64());
        Ok(())
    }
}

impl Engine {
    /// Rewrite the WAL as a single snapshot record of the current state.
    /// Used and expired tokens are dropped from the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        // Resource locks first (sorted), then the commit gate: same order as every commit.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rs) = self.get_resource(id) {
                guards.push(rs.read_owned().await);
            }
        }
        let _gate = self.commit_gate.write().await;

        let current: HashSet<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        if current.len() != guards.len() || guards.iter().any(|g| !current.contains(&g.id)) {
            debug!("resource set changed during compaction, skipping");
            return Ok(());
        }

        let mut snapshot = Vec::new();
        for guard in &guards {
            snapshot.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for identity in &guard.managers {
                snapshot.push(Event::ManagerAssigned {
                    resource_id: guard.id,
                    identity: identity.clone(),
                });
            }
            for question in &guard.questions {
                snapshot.push(Event::QuestionAdded {
                    resource_id: guard.id,
                    question: question.clone(),
                });
            }
            for window in &guard.windows {
                snapshot.push(Event::WindowCreated {
                    resource_id: guard.id,
                    window: window.clone(),
                });
                if let Some(answers) = guard.answers.get(&window.id) {
                    snapshot.push(Event::AnswersRecorded {
                        resource_id: guard.id,
                        window_id: window.id,
                        answers: answers.clone(),
                    });
                }
            }
        }

        let now = self.now();
        let mut dropped = Vec::new();
        for entry in self.tokens.iter() {
            if entry.used || entry.is_expired(now) {
                dropped.push(entry.key().clone());
            } else {
                snapshot.push(Event::TokenIssued {
                    digest: entry.key().clone(),
                    token: entry.value().clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))?;

        for digest in &dropped {
            self.tokens.remove(digest);
        }
        tracing::info!(dropped_tokens = dropped.len(), "WAL compacted");
        Ok(())
    }

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
}
