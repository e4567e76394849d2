use chrono::{Duration, NaiveDateTime};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NewClaimNotice, Notification, StatusChangeNotice};
use crate::tokens;

use super::{Engine, EngineError, Txn};

/// Whether claim answers are checked against the resource's questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerCheck {
    Enforce,
    /// Only for callers that already validated, e.g. a confirmed guest request.
    Skip,
}

/// What an emailed manager link did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redeemed {
    Approved(TimeWindow),
    Rejected(Termination),
}

pub(crate) fn ensure_can_manage(rs: &ResourceState, actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() || rs.is_manager(&actor.identity) {
        return Ok(());
    }
    Err(EngineError::Unauthorized(format!(
        "{} does not manage resource {}",
        actor.identity, rs.id
    )))
}

pub(crate) fn validate_identity(identity: &str) -> Result<String, EngineError> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(EngineError::Validation("claimant identity is required".into()));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::Validation("claimant identity too long".into()));
    }
    Ok(identity.to_string())
}

pub(crate) fn validate_purpose(purpose: Option<String>) -> Result<Option<String>, EngineError> {
    let purpose = purpose
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    if purpose.as_ref().is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
        return Err(EngineError::Validation("purpose too long".into()));
    }
    Ok(purpose)
}

/// Every required question answered; every answer well-formed for its question.
pub(crate) fn validate_answers(rs: &ResourceState, answers: &[Answer]) -> Result<(), EngineError> {
    for answer in answers {
        let question = rs.question(&answer.question_id).ok_or_else(|| {
            EngineError::Validation(format!("unknown question {}", answer.question_id))
        })?;
        let value = answer.value.trim();
        if value.len() > MAX_ANSWER_LEN {
            return Err(EngineError::Validation(format!(
                "answer to \"{}\" is too long",
                question.label
            )));
        }
        if value.is_empty() {
            continue;
        }
        match &question.kind {
            QuestionKind::Number if value.parse::<f64>().is_err() => {
                return Err(EngineError::Validation(format!(
                    "answer to \"{}\" must be a number",
                    question.label
                )));
            }
            QuestionKind::Dropdown { options } if !options.iter().any(|o| o == value) => {
                return Err(EngineError::Validation(format!(
                    "\"{value}\" is not an option for \"{}\"",
                    question.label
                )));
            }
            _ => {}
        }
    }

    for question in rs.questions.iter().filter(|q| q.required) {
        let answered = answers
            .iter()
            .any(|a| a.question_id == question.id && !a.value.trim().is_empty());
        if !answered {
            return Err(EngineError::Validation(format!(
                "\"{}\" is required",
                question.label
            )));
        }
    }
    Ok(())
}

pub(crate) fn plan_claim(
    rs: &ResourceState,
    window_id: Ulid,
    claim: Claim,
    answers: Vec<Answer>,
    check: AnswerCheck,
) -> Result<(Vec<Event>, TimeWindow), EngineError> {
    let window = rs
        .window(&window_id)
        .filter(|w| w.is_available())
        .ok_or(EngineError::NotFound(window_id))?;
    if check == AnswerCheck::Enforce {
        validate_answers(rs, &answers)?;
    }

    let mut claimed = window.clone();
    claimed.claim(claim.clone());

    let mut events = vec![Event::WindowClaimed {
        resource_id: rs.id,
        window_id,
        claim,
    }];
    if !answers.is_empty() {
        events.push(Event::AnswersRecorded {
            resource_id: rs.id,
            window_id,
            answers,
        });
    }
    Ok((events, claimed))
}

pub(crate) fn plan_approve(
    rs: &ResourceState,
    window_id: Ulid,
) -> Result<(Vec<Event>, TimeWindow), EngineError> {
    let window = rs.window(&window_id).ok_or(EngineError::NotFound(window_id))?;
    if !(window.is_booking() && window.status == WindowStatus::Pending) {
        return Err(EngineError::InvalidState {
            id: window_id,
            status: window.status,
        });
    }
    let mut approved = window.clone();
    approved.status = WindowStatus::Approved;
    let events = vec![Event::StatusChanged {
        resource_id: rs.id,
        window_id,
        status: WindowStatus::Approved,
    }];
    Ok((events, approved))
}

/// Reject or cancel a booking and put its time back on offer.
pub(crate) fn plan_terminate(
    rs: &ResourceState,
    window_id: Ulid,
    status: WindowStatus,
    now: NaiveDateTime,
) -> Result<(Vec<Event>, Termination), EngineError> {
    let allowed: &[WindowStatus] = match status {
        WindowStatus::Rejected => &[WindowStatus::Pending],
        WindowStatus::Canceled => &[WindowStatus::Pending, WindowStatus::Approved],
        other => {
            return Err(EngineError::Validation(format!(
                "{other} is not a rejection or cancellation"
            )));
        }
    };
    let window = rs.window(&window_id).ok_or(EngineError::NotFound(window_id))?;
    if !window.is_booking() || !allowed.contains(&window.status) {
        return Err(EngineError::InvalidState {
            id: window_id,
            status: window.status,
        });
    }

    let mut terminated = window.clone();
    terminated.status = status;
    let replacement = window.compensating_slot(Ulid::new(), now);

    let events = vec![
        Event::StatusChanged {
            resource_id: rs.id,
            window_id,
            status,
        },
        Event::WindowCreated {
            resource_id: rs.id,
            window: replacement.clone(),
        },
    ];
    Ok((
        events,
        Termination {
            window: terminated,
            replacement,
        },
    ))
}

/// Claimant-initiated cancellation: own bookings only, and not too close to the start.
pub(crate) fn plan_user_cancel(
    rs: &ResourceState,
    window_id: Ulid,
    identity: &str,
    now: NaiveDateTime,
) -> Result<(Vec<Event>, Termination), EngineError> {
    let window = rs.window(&window_id).ok_or(EngineError::NotFound(window_id))?;
    let owns = window
        .claimant()
        .is_some_and(|c| c.eq_ignore_ascii_case(identity.trim()));
    if !owns {
        return Err(EngineError::Unauthorized(
            "only the claimant may cancel this booking".into(),
        ));
    }
    if !matches!(window.status, WindowStatus::Pending | WindowStatus::Approved) {
        return Err(EngineError::InvalidState {
            id: window_id,
            status: window.status,
        });
    }
    if window.starts_at() - now < Duration::hours(USER_CANCEL_CUTOFF_HOURS) {
        return Err(EngineError::Policy(format!(
            "bookings can only be canceled more than {USER_CANCEL_CUTOFF_HOURS} hours before they start"
        )));
    }
    plan_terminate(rs, window_id, WindowStatus::Canceled, now)
}

impl Engine {
    /// Turn an available timeslot into a pending booking.
    pub async fn claim(
        &self,
        window_id: Ulid,
        identity: &str,
        purpose: Option<String>,
        answers: Vec<Answer>,
    ) -> Result<TimeWindow, EngineError> {
        let claimant = validate_identity(identity)?;
        let purpose = validate_purpose(purpose)?;
        let (mut txn, resource_id) = self.begin_for_window(&window_id).await?;
        let claim = Claim {
            claimant,
            purpose,
            claimed_at: self.now(),
        };
        let (window, notice) =
            self.stage_claim(&mut txn, resource_id, window_id, claim, answers, AnswerCheck::Enforce)?;
        txn.commit().await?;
        self.after_claim(&window, notice);
        Ok(window)
    }

    /// Stage a claim inside `txn`, plus manager action tokens when the resource has managers.
    pub(crate) fn stage_claim(
        &self,
        txn: &mut Txn<'_>,
        resource_id: Ulid,
        window_id: Ulid,
        claim: Claim,
        answers: Vec<Answer>,
        check: AnswerCheck,
    ) -> Result<(TimeWindow, Option<NewClaimNotice>), EngineError> {
        let rs = txn.resource(&resource_id)?;
        let (events, window) = plan_claim(rs, window_id, claim, answers, check)?;
        let managers: Vec<String> = rs.managers.iter().cloned().collect();
        let resource_name = rs.name.clone();
        txn.stage_all(events);

        if managers.is_empty() {
            return Ok((window, None));
        }
        let expires_at = self.now() + Duration::hours(ACTION_TOKEN_TTL_HOURS);
        let mut issue = |action| {
            let raw = tokens::generate();
            txn.stage(Event::TokenIssued {
                digest: tokens::digest(&raw),
                token: ActionToken {
                    payload: TokenPayload::ManagerAction { window_id, action },
                    expires_at,
                    used: false,
                },
            });
            raw
        };
        let approve_token = issue(TokenAction::Approve);
        let reject_token = issue(TokenAction::Reject);
        let notice = NewClaimNotice {
            window: window.clone(),
            resource_name,
            managers,
            approve_token,
            reject_token,
        };
        Ok((window, Some(notice)))
    }

    pub(crate) fn after_claim(&self, window: &TimeWindow, notice: Option<NewClaimNotice>) {
        info!(
            window_id = %window.id,
            resource_id = %window.resource_id,
            claimant = window.claimant().unwrap_or_default(),
            "window claimed"
        );
        crate::observability::record_transition("claim");
        if let Some(notice) = notice {
            self.notify(Notification::NewClaim(notice));
        }
    }

    pub async fn approve(&self, window_id: Ulid, actor: &Actor) -> Result<TimeWindow, EngineError> {
        let (mut txn, resource_id) = self.begin_for_window(&window_id).await?;
        let rs = txn.resource(&resource_id)?;
        ensure_can_manage(rs, actor)?;
        let (events, window) = plan_approve(rs, window_id)?;
        let resource_name = rs.name.clone();
        txn.stage_all(events);
        txn.commit().await?;

        info!(window_id = %window_id, actor = %actor.identity, "booking approved");
        self.after_status_change(&window, resource_name);
        Ok(window)
    }

    /// Reject a pending booking or cancel a pending/approved one on behalf of a manager.
    pub async fn reject_or_cancel(
        &self,
        window_id: Ulid,
        actor: &Actor,
        status: WindowStatus,
    ) -> Result<Termination, EngineError> {
        let (mut txn, resource_id) = self.begin_for_window(&window_id).await?;
        let rs = txn.resource(&resource_id)?;
        ensure_can_manage(rs, actor)?;
        let (events, termination) = plan_terminate(rs, window_id, status, self.now())?;
        let resource_name = rs.name.clone();
        txn.stage_all(events);
        txn.commit().await?;

        info!(
            window_id = %window_id,
            replacement_id = %termination.replacement.id,
            actor = %actor.identity,
            status = %status,
            "booking terminated, slot reopened"
        );
        self.after_status_change(&termination.window, resource_name);
        Ok(termination)
    }

    pub async fn reject(&self, window_id: Ulid, actor: &Actor) -> Result<Termination, EngineError> {
        self.reject_or_cancel(window_id, actor, WindowStatus::Rejected)
            .await
    }

    pub async fn admin_cancel(
        &self,
        window_id: Ulid,
        actor: &Actor,
    ) -> Result<Termination, EngineError> {
        self.reject_or_cancel(window_id, actor, WindowStatus::Canceled)
            .await
    }

    /// Claimant cancels their own booking.
    pub async fn user_cancel(
        &self,
        window_id: Ulid,
        identity: &str,
    ) -> Result<Termination, EngineError> {
        let (mut txn, resource_id) = self.begin_for_window(&window_id).await?;
        let rs = txn.resource(&resource_id)?;
        let (events, termination) = plan_user_cancel(rs, window_id, identity, self.now())?;
        let resource_name = rs.name.clone();
        txn.stage_all(events);
        txn.commit().await?;

        info!(
            window_id = %window_id,
            replacement_id = %termination.replacement.id,
            "booking canceled by claimant, slot reopened"
        );
        self.after_status_change(&termination.window, resource_name);
        Ok(termination)
    }

    /// Execute the approve/reject action behind an emailed manager link.
    pub async fn redeem_action_token(&self, raw_token: &str) -> Result<Redeemed, EngineError> {
        let digest = tokens::digest(raw_token.trim());
        let window_id = match self.tokens.get(&digest).map(|t| t.value().payload.clone()) {
            Some(TokenPayload::ManagerAction { window_id, .. }) => window_id,
            _ => return Err(EngineError::TokenNotFound),
        };

        let (mut txn, resource_id) = self.begin_for_window(&window_id).await?;
        // Re-read under the resource lock: every consumer of this token holds it.
        let token = self
            .tokens
            .get(&digest)
            .map(|t| t.value().clone())
            .ok_or(EngineError::TokenNotFound)?;
        if token.used {
            return Err(EngineError::TokenUsed);
        }
        if token.is_expired(self.now()) {
            return Err(EngineError::TokenExpired);
        }
        let TokenPayload::ManagerAction { action, .. } = token.payload else {
            return Err(EngineError::TokenNotFound);
        };

        let rs = txn.resource(&resource_id)?;
        let resource_name = rs.name.clone();
        let redeemed = match action {
            TokenAction::Approve => {
                let (events, window) = plan_approve(rs, window_id)?;
                txn.stage_all(events);
                Redeemed::Approved(window)
            }
            TokenAction::Reject => {
                let (events, termination) =
                    plan_terminate(rs, window_id, WindowStatus::Rejected, self.now())?;
                txn.stage_all(events);
                Redeemed::Rejected(termination)
            }
        };
        txn.stage(Event::TokenConsumed { digest });
        txn.commit().await?;

        info!(window_id = %window_id, action = ?action, "manager action token redeemed");
        match &redeemed {
            Redeemed::Approved(window) => self.after_status_change(window, resource_name),
            Redeemed::Rejected(t) => self.after_status_change(&t.window, resource_name),
        }
        Ok(redeemed)
    }

    fn after_status_change(&self, window: &TimeWindow, resource_name: String) {
        crate::observability::record_transition(window.status.as_str());
        self.notify(Notification::StatusChanged(StatusChangeNotice {
            window: window.clone(),
            resource_name,
            status: window.status,
        }));
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    fn at(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    fn resource_with_booking(claimant: &str, day: u32, hour: u32) -> (ResourceState, Ulid) {
        let mut rs = ResourceState::new(Ulid::new(), "Spectrometer".into());
        let start = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap();
        let mut w = TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            at(day, 0).date(),
            Span::new(start, end),
            at(1, 0),
        );
        w.claim(Claim {
            claimant: claimant.into(),
            purpose: None,
            claimed_at: at(1, 0),
        });
        let id = w.id;
        rs.insert_window(w);
        (rs, id)
    }

    #[test]
    fn answers_must_cover_required_questions() {
        let mut rs = ResourceState::new(Ulid::new(), "Cryostat".into());
        let q = FilterQuestion {
            id: Ulid::new(),
            label: "Project code".into(),
            kind: QuestionKind::Text,
            required: true,
        };
        rs.questions.push(q.clone());

        assert!(matches!(
            validate_answers(&rs, &[]),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_answers(&rs, &[Answer::text(q.id, "   ")]).is_err());
        assert!(validate_answers(&rs, &[Answer::text(q.id, "P-17")]).is_ok());
        let stray = [Answer::text(q.id, "P-17"), Answer::text(Ulid::new(), "x")];
        assert!(validate_answers(&rs, &stray).is_err());
    }

    #[test]
    fn typed_answers_are_checked() {
        let mut rs = ResourceState::new(Ulid::new(), "Cryostat".into());
        let number = FilterQuestion {
            id: Ulid::new(),
            label: "Samples".into(),
            kind: QuestionKind::Number,
            required: false,
        };
        let dropdown = FilterQuestion {
            id: Ulid::new(),
            label: "Mode".into(),
            kind: QuestionKind::Dropdown {
                options: vec!["fast".into(), "slow".into()],
            },
            required: false,
        };
        rs.questions.push(number.clone());
        rs.questions.push(dropdown.clone());

        assert!(validate_answers(&rs, &[Answer::text(number.id, "12.5")]).is_ok());
        assert!(validate_answers(&rs, &[Answer::text(number.id, "many")]).is_err());
        assert!(validate_answers(&rs, &[Answer::text(dropdown.id, "slow")]).is_ok());
        assert!(validate_answers(&rs, &[Answer::text(dropdown.id, "medium")]).is_err());
    }

    #[test]
    fn user_cancel_cutoff_is_exclusive_at_24_hours() {
        let (rs, id) = resource_with_booking("ana@example.com", 10, 12);
        // Exactly 24h before start is still allowed.
        assert!(plan_user_cancel(&rs, id, "ana@example.com", at(9, 12)).is_ok());
        let late = plan_user_cancel(&rs, id, "ana@example.com", at(9, 13));
        assert!(matches!(late, Err(EngineError::Policy(_))));
    }

    #[test]
    fn user_cancel_checks_claimant_first() {
        let (rs, id) = resource_with_booking("ana@example.com", 10, 12);
        let err = plan_user_cancel(&rs, id, "bo@example.com", at(9, 20)).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn terminate_emits_replacement_slot() {
        let (rs, id) = resource_with_booking("ana@example.com", 10, 12);
        let (events, t) = plan_terminate(&rs, id, WindowStatus::Rejected, at(2, 0)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(t.window.status, WindowStatus::Rejected);
        assert!(t.replacement.is_available());
        assert_eq!(t.replacement.span, t.window.span);
        assert_eq!(t.replacement.date, t.window.date);
    }

    #[test]
    fn terminate_rejects_non_terminal_targets() {
        let (rs, id) = resource_with_booking("ana@example.com", 10, 12);
        assert!(matches!(
            plan_terminate(&rs, id, WindowStatus::Approved, at(2, 0)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn approve_requires_pending_booking() {
        let mut rs = ResourceState::new(Ulid::new(), "Oven".into());
        let slot = TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            at(10, 0).date(),
            Span::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ),
            at(1, 0),
        );
        let slot_id = slot.id;
        rs.insert_window(slot);
        assert!(matches!(
            plan_approve(&rs, slot_id),
            Err(EngineError::InvalidState { .. })
        ));
    }
}
