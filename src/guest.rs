//! Reserve-then-confirm booking for visitors without an account.
//!
//! `request` validates everything and parks the claim behind a single-use token
//! mailed to the guest; the window itself is untouched. `confirm` redeems the
//! token and performs the claim.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use tokio::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;
use validator::Validate;

use crate::engine::{AnswerCheck, Engine, EngineError, validate_answers};
use crate::files::FileStore;
use crate::limits::*;
use crate::model::*;
use crate::notify::{GuestVerificationNotice, Notification};
use crate::tokens;

/// Knows which emails belong to registered accounts.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn is_registered(&self, email: &str) -> bool;
}

/// Every email is a guest.
pub struct NoAccounts;

#[async_trait]
impl AccountDirectory for NoAccounts {
    async fn is_registered(&self, _email: &str) -> bool {
        false
    }
}

#[async_trait]
impl AccountDirectory for HashSet<String> {
    async fn is_registered(&self, email: &str) -> bool {
        self.iter().any(|known| known.eq_ignore_ascii_case(email))
    }
}

#[derive(Debug, Clone)]
pub struct GuestSettings {
    /// Claims one email may hold per calendar day.
    pub daily_limit: usize,
    pub token_ttl: Duration,
    /// Base of the confirmation link, without trailing slash.
    pub public_url: String,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_GUEST_DAILY_LIMIT,
            token_ttl: Duration::hours(GUEST_TOKEN_TTL_HOURS),
            public_url: "http://localhost:8080".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub question_id: Ulid,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Validate)]
pub struct GuestRequest {
    pub window_id: Ulid,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 2000))]
    pub purpose: Option<String>,
    pub answers: Vec<Answer>,
    pub files: Vec<UploadedFile>,
}

impl GuestRequest {
    fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.email = self.email.trim().to_string();
        self.purpose = self
            .purpose
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self
    }
}

/// Returned by `request`. The token itself only travels by email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestReceipt {
    pub window_id: Ulid,
    pub expires_at: NaiveDateTime,
}

pub struct GuestFlow {
    engine: Arc<Engine>,
    files: Arc<dyn FileStore>,
    accounts: Arc<dyn AccountDirectory>,
    settings: GuestSettings,
    /// Confirmations run one at a time so the daily limit re-check holds.
    confirm_lock: Mutex<()>,
}

impl GuestFlow {
    pub fn new(
        engine: Arc<Engine>,
        files: Arc<dyn FileStore>,
        accounts: Arc<dyn AccountDirectory>,
        settings: GuestSettings,
    ) -> Self {
        Self {
            engine,
            files,
            accounts,
            settings,
            confirm_lock: Mutex::new(()),
        }
    }

    fn over_daily_limit(&self, email: &str, window: &TimeWindow) -> bool {
        self.engine.claims_on(email, window.date) >= self.settings.daily_limit
    }

    /// Phase 1: validate, stage uploads, store the intent and mail a confirmation link.
    pub async fn request(&self, req: GuestRequest) -> Result<GuestReceipt, EngineError> {
        let mut req = req.normalized();
        req.validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if self.accounts.is_registered(&req.email).await {
            return Err(EngineError::Policy(
                "this email belongs to a registered account, please sign in to book".into(),
            ));
        }

        let window = self.engine.get_window(req.window_id).await?;
        if !window.is_available() {
            return Err(EngineError::NotFound(req.window_id));
        }
        {
            let rs = self
                .engine
                .get_resource(&window.resource_id)
                .ok_or(EngineError::NotFound(window.resource_id))?;
            let guard = rs.read().await;
            for upload in &req.files {
                let is_document = guard
                    .question(&upload.question_id)
                    .is_some_and(|q| q.kind == QuestionKind::Document);
                if !is_document {
                    return Err(EngineError::Validation(format!(
                        "question {} does not take a document",
                        upload.question_id
                    )));
                }
                if !req.answers.iter().any(|a| a.question_id == upload.question_id) {
                    req.answers
                        .push(Answer::text(upload.question_id, upload.file_name.clone()));
                }
            }
            validate_answers(&guard, &req.answers)?;
        }
        if self.over_daily_limit(&req.email, &window) {
            return Err(EngineError::Policy(format!(
                "{} already has the maximum number of bookings on {}",
                req.email, window.date
            )));
        }

        let staged_files = self.stage_uploads(&req.files).await?;
        let staged_paths: Vec<PathBuf> =
            staged_files.iter().map(|f| PathBuf::from(&f.temp_path)).collect();

        let raw = tokens::generate();
        let expires_at = self.engine.now() + self.settings.token_ttl;
        let intent = GuestClaimIntent {
            window_id: req.window_id,
            name: req.name.clone(),
            email: req.email.clone(),
            purpose: req.purpose,
            answers: req.answers,
            staged_files,
        };

        let mut txn = self.engine.begin(&[]).await?;
        txn.stage(Event::TokenIssued {
            digest: tokens::digest(&raw),
            token: ActionToken {
                payload: TokenPayload::GuestClaim(intent),
                expires_at,
                used: false,
            },
        });
        if let Err(e) = txn.commit().await {
            self.files.cleanup(&staged_paths).await;
            return Err(e);
        }

        info!(window_id = %req.window_id, email = %req.email, "guest claim requested");
        metrics::counter!(crate::observability::GUEST_REQUESTS_TOTAL, "stage" => "requested")
            .increment(1);
        self.engine.notify(Notification::GuestVerification(GuestVerificationNotice {
            name: req.name,
            email: req.email,
            confirm_url: format!(
                "{}/guest/confirm?token={raw}",
                self.settings.public_url.trim_end_matches('/')
            ),
        }));
        Ok(GuestReceipt {
            window_id: req.window_id,
            expires_at,
        })
    }

    async fn stage_uploads(&self, uploads: &[UploadedFile]) -> Result<Vec<StagedFile>, EngineError> {
        let mut staged = Vec::with_capacity(uploads.len());
        let mut paths = Vec::with_capacity(uploads.len());
        for upload in uploads {
            match self.files.stage_temp(&upload.file_name, &upload.bytes).await {
                Ok(path) => {
                    staged.push(StagedFile {
                        question_id: upload.question_id,
                        temp_path: path.to_string_lossy().into_owned(),
                    });
                    paths.push(path);
                }
                Err(e) => {
                    self.files.cleanup(&paths).await;
                    return Err(EngineError::Store(format!("staging upload failed: {e}")));
                }
            }
        }
        Ok(staged)
    }

    /// Phase 2: redeem the emailed token and claim the window for the guest.
    ///
    /// A failure the guest cannot fix by retrying (window taken, daily limit reached)
    /// spends the token and deletes the staged uploads. A store failure leaves both
    /// in place so the same link can be tried again.
    pub async fn confirm(&self, raw_token: &str) -> Result<TimeWindow, EngineError> {
        let _serial = self.confirm_lock.lock().await;
        let digest = tokens::digest(raw_token.trim());
        let token = self
            .engine
            .token(&digest)
            .ok_or(EngineError::TokenNotFound)?;
        let (used, expired) = (token.used, token.is_expired(self.engine.now()));
        let TokenPayload::GuestClaim(intent) = token.payload else {
            return Err(EngineError::TokenNotFound);
        };
        if used {
            return Err(EngineError::TokenUsed);
        }
        if expired {
            return Err(EngineError::TokenExpired);
        }

        let staged_paths: Vec<PathBuf> = intent
            .staged_files
            .iter()
            .map(|f| PathBuf::from(&f.temp_path))
            .collect();

        let (mut txn, resource_id) = match self.engine.begin_for_window(&intent.window_id).await {
            Ok(opened) => opened,
            Err(e) => return Err(self.abandon(digest, &staged_paths, e).await),
        };
        let claimable = txn
            .resource(&resource_id)
            .and_then(|rs| {
                rs.window(&intent.window_id)
                    .filter(|w| w.is_available())
                    .cloned()
                    .ok_or(EngineError::NotFound(intent.window_id))
            })
            .and_then(|window| {
                if self.over_daily_limit(&intent.email, &window) {
                    Err(EngineError::Policy(format!(
                        "{} already has the maximum number of bookings on {}",
                        intent.email, window.date
                    )))
                } else {
                    Ok(window)
                }
            });
        if let Err(e) = claimable {
            drop(txn);
            return Err(self.abandon(digest, &staged_paths, e).await);
        }

        let mut answers = intent.answers;
        let mut promoted = Vec::with_capacity(intent.staged_files.len());
        for file in &intent.staged_files {
            match self
                .files
                .promote(&PathBuf::from(&file.temp_path), intent.window_id)
                .await
            {
                Ok(path) => {
                    for answer in answers.iter_mut().filter(|a| a.question_id == file.question_id) {
                        answer.document_path = Some(path.to_string_lossy().into_owned());
                    }
                    promoted.push(path);
                }
                Err(e) => {
                    warn!(window_id = %intent.window_id, "promoting guest upload failed: {e}");
                    self.files.cleanup(&promoted).await;
                    metrics::counter!(crate::observability::GUEST_REQUESTS_TOTAL, "stage" => "confirm_failed")
                        .increment(1);
                    return Err(EngineError::Store(format!("storing upload failed: {e}")));
                }
            }
        }

        let claim = Claim {
            claimant: intent.email.clone(),
            purpose: intent.purpose,
            claimed_at: self.engine.now(),
        };
        let staged = self.engine.stage_claim(
            &mut txn,
            resource_id,
            intent.window_id,
            claim,
            answers,
            AnswerCheck::Skip,
        );
        let (claimed, notice) = match staged {
            Ok(done) => done,
            Err(e) => {
                drop(txn);
                self.files.cleanup(&promoted).await;
                return Err(self.abandon(digest, &staged_paths, e).await);
            }
        };
        txn.stage(Event::TokenConsumed { digest });
        if let Err(e) = txn.commit().await {
            self.files.cleanup(&promoted).await;
            return Err(e);
        }
        self.files.cleanup(&staged_paths).await;

        info!(
            window_id = %claimed.id,
            email = %intent.email,
            guest = %intent.name,
            "guest claim confirmed"
        );
        metrics::counter!(crate::observability::GUEST_REQUESTS_TOTAL, "stage" => "confirmed")
            .increment(1);
        self.engine.after_claim(&claimed, notice);
        Ok(claimed)
    }

    /// Give up on a guest intent for good: spend its token, drop its uploads,
    /// and hand back the error that caused it.
    async fn abandon(&self, digest: String, staged: &[PathBuf], cause: EngineError) -> EngineError {
        self.files.cleanup(staged).await;
        if let Err(e) = self.retire_token(digest).await {
            warn!("could not retire guest token: {e}");
        }
        info!(reason = %cause, "guest claim abandoned");
        metrics::counter!(crate::observability::GUEST_REQUESTS_TOTAL, "stage" => "abandoned")
            .increment(1);
        cause
    }

    async fn retire_token(&self, digest: String) -> Result<(), EngineError> {
        let mut txn = self.engine.begin(&[]).await?;
        txn.stage(Event::TokenConsumed { digest });
        txn.commit().await
    }

    /// Delete staged uploads older than the guest token lifetime. Their tokens
    /// have expired, so no confirmation can still need them.
    pub async fn purge_stale_uploads(&self) -> usize {
        let max_age = self.settings.token_ttl.to_std().unwrap_or_default();
        match self.files.purge_staged(max_age).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "stale guest uploads purged");
                }
                removed
            }
            Err(e) => {
                warn!("purging stale guest uploads failed: {e}");
                0
            }
        }
    }
}
