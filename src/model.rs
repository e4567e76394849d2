use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowStatus {
    Available,
    Pending,
    Approved,
    Rejected,
    Completed,
    Expired,
    Canceled,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Available => "available",
            WindowStatus::Pending => "pending",
            WindowStatus::Approved => "approved",
            WindowStatus::Rejected => "rejected",
            WindowStatus::Completed => "completed",
            WindowStatus::Expired => "expired",
            WindowStatus::Canceled => "canceled",
        }
    }

    /// No transition ever leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WindowStatus::Rejected
                | WindowStatus::Completed
                | WindowStatus::Expired
                | WindowStatus::Canceled
        )
    }
}

impl std::fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who claimed a window and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claimant: String,
    pub purpose: Option<String>,
    pub claimed_at: NaiveDateTime,
}

/// What a window represents. The claimant identity only exists on bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    /// Unclaimed offer.
    Timeslot,
    /// Claimed request.
    Booking(Claim),
}

/// A single bookable window on a resource: timeslots and bookings share one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: WindowStatus,
    pub kind: WindowKind,
    pub created_at: NaiveDateTime,
}

impl TimeWindow {
    /// The only way to mint a window: an available, unclaimed timeslot.
    pub fn timeslot(
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id,
            resource_id,
            date,
            span,
            status: WindowStatus::Available,
            kind: WindowKind::Timeslot,
            created_at,
        }
    }

    /// Turn this timeslot into a pending booking.
    pub fn claim(&mut self, claim: Claim) {
        self.kind = WindowKind::Booking(claim);
        self.status = WindowStatus::Pending;
    }

    /// Fresh available timeslot covering the same time as `self`.
    pub fn compensating_slot(&self, id: Ulid, created_at: NaiveDateTime) -> Self {
        Self::timeslot(id, self.resource_id, self.date, self.span, created_at)
    }

    pub fn is_timeslot(&self) -> bool {
        matches!(self.kind, WindowKind::Timeslot)
    }

    pub fn is_booking(&self) -> bool {
        matches!(self.kind, WindowKind::Booking(_))
    }

    pub fn is_available(&self) -> bool {
        self.is_timeslot() && self.status == WindowStatus::Available
    }

    pub fn claim_info(&self) -> Option<&Claim> {
        match &self.kind {
            WindowKind::Booking(claim) => Some(claim),
            WindowKind::Timeslot => None,
        }
    }

    pub fn claimant(&self) -> Option<&str> {
        self.claim_info().map(|c| c.claimant.as_str())
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.span.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.span.end)
    }

    /// Timeslots may only be Available or Expired; bookings never Available.
    pub fn is_consistent(&self) -> bool {
        match self.kind {
            WindowKind::Timeslot => {
                matches!(self.status, WindowStatus::Available | WindowStatus::Expired)
            }
            WindowKind::Booking(_) => self.status != WindowStatus::Available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    Text,
    Number,
    Dropdown { options: Vec<String> },
    Document,
}

/// Per-resource question asked at claim time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuestion {
    pub id: Ulid,
    pub label: String,
    pub kind: QuestionKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: Ulid,
    pub value: String,
    /// Where the uploaded document lives, for `Document` questions.
    pub document_path: Option<String>,
}

impl Answer {
    pub fn text(question_id: Ulid, value: impl Into<String>) -> Self {
        Self {
            question_id,
            value: value.into(),
            document_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Manager,
    User,
}

/// The authenticated caller, as supplied by the authorization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub identity: String,
    pub role: Role,
}

impl Actor {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenAction {
    Approve,
    Reject,
}

/// A document uploaded during a guest request, parked in temporary storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub question_id: Ulid,
    pub temp_path: String,
}

/// Booking metadata held back until the guest confirms by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestClaimIntent {
    pub window_id: Ulid,
    pub name: String,
    pub email: String,
    pub purpose: Option<String>,
    pub answers: Vec<Answer>,
    pub staged_files: Vec<StagedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPayload {
    ManagerAction { window_id: Ulid, action: TokenAction },
    GuestClaim(GuestClaimIntent),
}

impl TokenPayload {
    pub fn window_id(&self) -> Ulid {
        match self {
            TokenPayload::ManagerAction { window_id, .. } => *window_id,
            TokenPayload::GuestClaim(intent) => intent.window_id,
        }
    }
}

/// Single-use token record. The raw token is never stored, only its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionToken {
    pub payload: TokenPayload,
    pub expires_at: NaiveDateTime,
    pub used: bool,
}

impl ActionToken {
    /// Valid strictly before `expires_at`.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Identities allowed to approve on this resource.
    pub managers: BTreeSet<String>,
    pub questions: Vec<FilterQuestion>,
    /// All windows, sorted by `(date, span.start)`.
    pub windows: Vec<TimeWindow>,
    pub answers: HashMap<Ulid, Vec<Answer>>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            managers: BTreeSet::new(),
            questions: Vec::new(),
            windows: Vec::new(),
            answers: HashMap::new(),
        }
    }

    /// Insert window maintaining sort order by `(date, span.start)`.
    pub fn insert_window(&mut self, window: TimeWindow) {
        let key = (window.date, window.span.start);
        let pos = self
            .windows
            .partition_point(|w| (w.date, w.span.start) <= key);
        self.windows.insert(pos, window);
    }

    pub fn window(&self, id: &Ulid) -> Option<&TimeWindow> {
        self.windows.iter().find(|w| w.id == *id)
    }

    pub fn window_mut(&mut self, id: &Ulid) -> Option<&mut TimeWindow> {
        self.windows.iter_mut().find(|w| w.id == *id)
    }

    /// All windows on `date`, via binary search on the sorted list.
    pub fn windows_on(&self, date: NaiveDate) -> &[TimeWindow] {
        let lo = self.windows.partition_point(|w| w.date < date);
        let hi = self.windows.partition_point(|w| w.date <= date);
        &self.windows[lo..hi]
    }

    /// Available timeslots on `date` whose span overlaps `span`.
    pub fn available_overlapping(
        &self,
        date: NaiveDate,
        span: &Span,
    ) -> impl Iterator<Item = &TimeWindow> {
        self.windows_on(date)
            .iter()
            .filter(move |w| w.is_available() && w.span.overlaps(span))
    }

    pub fn question(&self, id: &Ulid) -> Option<&FilterQuestion> {
        self.questions.iter().find(|q| q.id == *id)
    }

    pub fn is_manager(&self, identity: &str) -> bool {
        self.managers.contains(identity)
    }
}

/// Persisted state changes. A WAL entry is one committed batch of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
    },
    ManagerAssigned {
        resource_id: Ulid,
        identity: String,
    },
    ManagerRevoked {
        resource_id: Ulid,
        identity: String,
    },
    QuestionAdded {
        resource_id: Ulid,
        question: FilterQuestion,
    },
    QuestionRemoved {
        resource_id: Ulid,
        question_id: Ulid,
    },
    WindowCreated {
        resource_id: Ulid,
        window: TimeWindow,
    },
    WindowClaimed {
        resource_id: Ulid,
        window_id: Ulid,
        claim: Claim,
    },
    AnswersRecorded {
        resource_id: Ulid,
        window_id: Ulid,
        answers: Vec<Answer>,
    },
    StatusChanged {
        resource_id: Ulid,
        window_id: Ulid,
        status: WindowStatus,
    },
    TokenIssued {
        digest: String,
        token: ActionToken,
    },
    TokenConsumed {
        digest: String,
    },
}

impl Event {
    /// The resource this event mutates; `None` for global records.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceCreated { id, .. } => Some(*id),
            Event::ManagerAssigned { resource_id, .. }
            | Event::ManagerRevoked { resource_id, .. }
            | Event::QuestionAdded { resource_id, .. }
            | Event::QuestionRemoved { resource_id, .. }
            | Event::WindowCreated { resource_id, .. }
            | Event::WindowClaimed { resource_id, .. }
            | Event::AnswersRecorded { resource_id, .. }
            | Event::StatusChanged { resource_id, .. } => Some(*resource_id),
            Event::TokenIssued { .. } | Event::TokenConsumed { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub managers: Vec<String>,
    pub questions: Vec<FilterQuestion>,
}

/// Result of a batch creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub skipped: usize,
}

/// Per-category counts from one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: usize,
    pub expired: usize,
    pub expired_slots: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.completed + self.expired + self.expired_slots
    }
}

/// A terminated booking together with the timeslot that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub window: TimeWindow,
    pub replacement: TimeWindow,
}
