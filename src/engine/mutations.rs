use chrono::{NaiveDate, NaiveTime};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::lifecycle::{ensure_can_manage, validate_identity};
use super::overlap::{BatchRequest, plan_batch, validate_batch, validate_not_past, validate_span};
use super::{Engine, EngineError};

fn ensure_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(format!(
            "{} is not an administrator",
            actor.identity
        )))
    }
}

fn validate_label(label: &str, what: &str) -> Result<String, EngineError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(EngineError::Validation(format!("{what} is required")));
    }
    if label.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!("{what} too long")));
    }
    Ok(label.to_string())
}

impl Engine {
    pub async fn create_resource(&self, actor: &Actor, name: &str) -> Result<Ulid, EngineError> {
        ensure_admin(actor)?;
        let name = validate_label(name, "resource name")?;
        let id = Ulid::new();

        let mut txn = self.begin(&[]).await?;
        txn.stage(Event::ResourceCreated {
            id,
            name: name.clone(),
        });
        txn.commit().await?;
        info!(resource_id = %id, name = %name, "resource created");
        Ok(id)
    }

    pub async fn assign_manager(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        identity: &str,
    ) -> Result<(), EngineError> {
        ensure_admin(actor)?;
        let identity = validate_identity(identity)?;
        let mut txn = self.begin(&[resource_id]).await?;
        if txn.resource(&resource_id)?.is_manager(&identity) {
            return Ok(());
        }
        txn.stage(Event::ManagerAssigned {
            resource_id,
            identity: identity.clone(),
        });
        txn.commit().await?;
        info!(resource_id = %resource_id, manager = %identity, "manager assigned");
        Ok(())
    }

    pub async fn revoke_manager(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        identity: &str,
    ) -> Result<(), EngineError> {
        ensure_admin(actor)?;
        let identity = identity.trim();
        let mut txn = self.begin(&[resource_id]).await?;
        if !txn.resource(&resource_id)?.is_manager(identity) {
            return Ok(());
        }
        txn.stage(Event::ManagerRevoked {
            resource_id,
            identity: identity.to_string(),
        });
        txn.commit().await?;
        info!(resource_id = %resource_id, manager = %identity, "manager revoked");
        Ok(())
    }

    pub async fn add_question(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        label: &str,
        kind: QuestionKind,
        required: bool,
    ) -> Result<Ulid, EngineError> {
        let label = validate_label(label, "question label")?;
        if let QuestionKind::Dropdown { options } = &kind
            && (options.is_empty() || options.iter().any(|o| o.trim().is_empty()))
        {
            return Err(EngineError::Validation(
                "dropdown questions need non-empty options".into(),
            ));
        }

        let mut txn = self.begin(&[resource_id]).await?;
        let rs = txn.resource(&resource_id)?;
        ensure_can_manage(rs, actor)?;
        if rs.questions.len() >= MAX_QUESTIONS_PER_RESOURCE {
            return Err(EngineError::Validation(format!(
                "at most {MAX_QUESTIONS_PER_RESOURCE} questions per resource"
            )));
        }

        let question = FilterQuestion {
            id: Ulid::new(),
            label,
            kind,
            required,
        };
        let question_id = question.id;
        txn.stage(Event::QuestionAdded {
            resource_id,
            question,
        });
        txn.commit().await?;
        info!(resource_id = %resource_id, question_id = %question_id, "question added");
        Ok(question_id)
    }

    pub async fn remove_question(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        question_id: Ulid,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin(&[resource_id]).await?;
        let rs = txn.resource(&resource_id)?;
        ensure_can_manage(rs, actor)?;
        if rs.question(&question_id).is_none() {
            return Err(EngineError::NotFound(question_id));
        }
        txn.stage(Event::QuestionRemoved {
            resource_id,
            question_id,
        });
        txn.commit().await
    }

    /// Offer a single timeslot. Overlapping an available window is refused.
    pub async fn create_timeslot(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<TimeWindow, EngineError> {
        let span = validate_span(start, end)?;
        let now = self.now();
        validate_not_past(date, now)?;

        let mut txn = self.begin(&[resource_id]).await?;
        let rs = txn.resource(&resource_id)?;
        ensure_can_manage(rs, actor)?;
        if let Some(existing) = rs.available_overlapping(date, &span).next() {
            return Err(EngineError::Policy(format!(
                "overlaps available timeslot {} ({}-{})",
                existing.id, existing.span.start, existing.span.end
            )));
        }

        let window = TimeWindow::timeslot(Ulid::new(), resource_id, date, span, now);
        txn.stage(Event::WindowCreated {
            resource_id,
            window: window.clone(),
        });
        txn.commit().await?;
        info!(window_id = %window.id, resource_id = %resource_id, date = %date, "timeslot created");
        Ok(window)
    }

    /// Generate a run of timeslots in one transaction, silently skipping overlaps.
    pub async fn create_batch(
        &self,
        actor: &Actor,
        req: BatchRequest,
    ) -> Result<BatchOutcome, EngineError> {
        let now = self.now();
        let candidates = validate_batch(&req, now)?;

        let mut txn = self.begin(&[req.resource_id]).await?;
        let rs = txn.resource(&req.resource_id)?;
        ensure_can_manage(rs, actor)?;
        let (windows, outcome) = plan_batch(rs, &req, &candidates, now);
        txn.stage_all(windows.into_iter().map(|window| Event::WindowCreated {
            resource_id: req.resource_id,
            window,
        }));
        txn.commit().await?;

        metrics::counter!(crate::observability::BATCH_SLOTS_TOTAL, "outcome" => "created")
            .increment(outcome.created as u64);
        metrics::counter!(crate::observability::BATCH_SLOTS_TOTAL, "outcome" => "skipped")
            .increment(outcome.skipped as u64);
        info!(
            resource_id = %req.resource_id,
            start_date = %req.start_date,
            end_date = %req.end_date,
            created = outcome.created,
            skipped = outcome.skipped,
            "batch timeslots created"
        );
        Ok(outcome)
    }
}
