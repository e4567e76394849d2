//! Hard limits and fixed business rules.

/// Longest date range a single batch may cover, in days.
pub const MAX_BATCH_DAYS: i64 = 366;

/// Upper bound on generated slots per day (5-minute slots around the clock).
pub const MAX_SLOTS_PER_DAY: u32 = 288;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_PURPOSE_LEN: usize = 2_000;
pub const MAX_ANSWER_LEN: usize = 10_000;
pub const MAX_QUESTIONS_PER_RESOURCE: usize = 64;
pub const MAX_IDENTITY_LEN: usize = 320;

/// Claimants may cancel on their own only this long before the start.
pub const USER_CANCEL_CUTOFF_HOURS: i64 = 24;

/// Lifetime of emailed manager approve/reject links.
pub const ACTION_TOKEN_TTL_HOURS: i64 = 24;

/// Default lifetime of a guest confirmation link.
pub const GUEST_TOKEN_TTL_HOURS: i64 = 24;

/// Default number of guest claims per email per day.
pub const DEFAULT_GUEST_DAILY_LIMIT: usize = 1;

/// Random bytes per token before hex encoding.
pub const TOKEN_BYTES: usize = 32;
