use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Parameters for generating a run of equally sized timeslots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub resource_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub daily_start: NaiveTime,
    pub slot_minutes: u32,
    pub slots_per_day: u32,
}

pub(crate) fn validate_span(start: NaiveTime, end: NaiveTime) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start time {start} must be before end time {end}"
        )));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_not_past(date: NaiveDate, now: NaiveDateTime) -> Result<(), EngineError> {
    if date < now.date() {
        return Err(EngineError::Validation(format!(
            "date {date} is in the past"
        )));
    }
    Ok(())
}

/// The `(start, end)` pairs generated for one day. Identical for every day of a batch.
pub fn day_candidates(
    daily_start: NaiveTime,
    slot_minutes: u32,
    slots_per_day: u32,
) -> Result<Vec<Span>, EngineError> {
    if slot_minutes == 0 {
        return Err(EngineError::Validation("slot duration must be positive".into()));
    }
    if slots_per_day == 0 {
        return Err(EngineError::Validation("slots per day must be positive".into()));
    }
    if slots_per_day > MAX_SLOTS_PER_DAY {
        return Err(EngineError::Validation(format!(
            "at most {MAX_SLOTS_PER_DAY} slots per day"
        )));
    }

    let step = Duration::minutes(i64::from(slot_minutes));
    let mut spans = Vec::with_capacity(slots_per_day as usize);
    let mut start = daily_start;
    for _ in 0..slots_per_day {
        let (end, wrapped) = start.overflowing_add_signed(step);
        if wrapped != 0 || end <= start {
            return Err(EngineError::Validation(format!(
                "slot starting at {start} would run past midnight"
            )));
        }
        spans.push(Span::new(start, end));
        start = end;
    }
    Ok(spans)
}

pub(crate) fn validate_batch(req: &BatchRequest, now: NaiveDateTime) -> Result<Vec<Span>, EngineError> {
    if req.end_date < req.start_date {
        return Err(EngineError::Validation(format!(
            "end date {} is before start date {}",
            req.end_date, req.start_date
        )));
    }
    validate_not_past(req.start_date, now)?;
    let days = (req.end_date - req.start_date).num_days() + 1;
    if days > MAX_BATCH_DAYS {
        return Err(EngineError::Validation(format!(
            "a batch may cover at most {MAX_BATCH_DAYS} days"
        )));
    }
    day_candidates(req.daily_start, req.slot_minutes, req.slots_per_day)
}

/// Decide which candidates become new timeslots. A candidate is skipped when it
/// overlaps an available window already on that resource and day, or one planned
/// earlier in the same batch.
pub(crate) fn plan_batch(
    rs: &ResourceState,
    req: &BatchRequest,
    candidates: &[Span],
    now: NaiveDateTime,
) -> (Vec<TimeWindow>, BatchOutcome) {
    let mut planned: Vec<TimeWindow> = Vec::new();
    let mut outcome = BatchOutcome::default();

    for date in req.start_date.iter_days().take_while(|d| *d <= req.end_date) {
        let day_start = planned.len();
        for span in candidates {
            let clashes_existing = rs.available_overlapping(date, span).next().is_some();
            let clashes_planned = planned[day_start..].iter().any(|w| w.span.overlaps(span));
            if clashes_existing || clashes_planned {
                outcome.skipped += 1;
                continue;
            }
            planned.push(TimeWindow::timeslot(Ulid::new(), rs.id, date, *span, now));
            outcome.created += 1;
        }
    }

    (planned, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn request(rs: &ResourceState, start: NaiveDate, end: NaiveDate) -> BatchRequest {
        BatchRequest {
            resource_id: rs.id,
            start_date: start,
            end_date: end,
            daily_start: t(9, 0),
            slot_minutes: 60,
            slots_per_day: 2,
        }
    }

    #[test]
    fn candidates_walk_forward() {
        let spans = day_candidates(t(9, 0), 45, 3).unwrap();
        assert_eq!(
            spans,
            vec![
                Span::new(t(9, 0), t(9, 45)),
                Span::new(t(9, 45), t(10, 30)),
                Span::new(t(10, 30), t(11, 15)),
            ]
        );
    }

    #[test]
    fn candidates_reject_midnight_overflow() {
        assert!(matches!(
            day_candidates(t(22, 0), 60, 3),
            Err(EngineError::Validation(_))
        ));
        // Ending exactly at midnight wraps to 00:00 and is rejected too.
        assert!(day_candidates(t(23, 0), 60, 1).is_err());
        assert!(day_candidates(t(22, 0), 60, 1).is_ok());
    }

    #[test]
    fn candidates_reject_zero_inputs() {
        assert!(day_candidates(t(9, 0), 0, 1).is_err());
        assert!(day_candidates(t(9, 0), 30, 0).is_err());
        assert!(day_candidates(t(0, 0), 1, MAX_SLOTS_PER_DAY + 1).is_err());
    }

    #[test]
    fn batch_rejects_past_and_inverted_ranges() {
        let rs = ResourceState::new(Ulid::new(), "Press".into());
        let now = d(2025, 1, 10).and_time(t(12, 0));

        let past = request(&rs, d(2025, 1, 9), d(2025, 1, 12));
        assert!(matches!(validate_batch(&past, now), Err(EngineError::Validation(_))));

        let inverted = request(&rs, d(2025, 1, 12), d(2025, 1, 11));
        assert!(matches!(validate_batch(&inverted, now), Err(EngineError::Validation(_))));

        // Today is allowed.
        let today = request(&rs, d(2025, 1, 10), d(2025, 1, 10));
        assert!(validate_batch(&today, now).is_ok());
    }

    #[test]
    fn batch_rejects_overlong_range() {
        let rs = ResourceState::new(Ulid::new(), "Press".into());
        let now = d(2025, 1, 1).and_time(t(0, 0));
        let req = request(&rs, d(2025, 1, 1), d(2026, 1, 2));
        assert!(validate_batch(&req, now).is_err());
    }

    #[test]
    fn plan_skips_overlap_with_available_only_on_same_day() {
        let now = d(2024, 12, 31).and_time(t(8, 0));
        let mut rs = ResourceState::new(Ulid::new(), "Furnace".into());
        rs.insert_window(TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            d(2025, 1, 1),
            Span::new(t(9, 0), t(10, 0)),
            now,
        ));
        let req = request(&rs, d(2025, 1, 1), d(2025, 1, 2));
        let candidates = validate_batch(&req, now).unwrap();
        let (planned, outcome) = plan_batch(&rs, &req, &candidates, now);

        assert_eq!(outcome, BatchOutcome { created: 3, skipped: 1 });
        assert_eq!(planned.len(), 3);
        assert!(planned.iter().all(|w| w.is_available()));
        assert!(
            !planned
                .iter()
                .any(|w| w.date == d(2025, 1, 1) && w.span.start == t(9, 0))
        );
    }

    #[test]
    fn plan_allows_touching_neighbours() {
        let now = d(2024, 12, 31).and_time(t(8, 0));
        let mut rs = ResourceState::new(Ulid::new(), "Furnace".into());
        rs.insert_window(TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            d(2025, 1, 1),
            Span::new(t(8, 0), t(9, 0)),
            now,
        ));
        rs.insert_window(TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            d(2025, 1, 1),
            Span::new(t(11, 0), t(12, 0)),
            now,
        ));
        let req = request(&rs, d(2025, 1, 1), d(2025, 1, 1));
        let candidates = validate_batch(&req, now).unwrap();
        let (_, outcome) = plan_batch(&rs, &req, &candidates, now);
        assert_eq!(outcome, BatchOutcome { created: 2, skipped: 0 });
    }

    #[test]
    fn plan_ignores_claimed_windows() {
        let now = d(2024, 12, 31).and_time(t(8, 0));
        let mut rs = ResourceState::new(Ulid::new(), "Furnace".into());
        let mut claimed = TimeWindow::timeslot(
            Ulid::new(),
            rs.id,
            d(2025, 1, 1),
            Span::new(t(9, 0), t(10, 0)),
            now,
        );
        claimed.claim(Claim {
            claimant: "bo@example.com".into(),
            purpose: None,
            claimed_at: now,
        });
        rs.insert_window(claimed);
        let req = request(&rs, d(2025, 1, 1), d(2025, 1, 1));
        let candidates = validate_batch(&req, now).unwrap();
        let (_, outcome) = plan_batch(&rs, &req, &candidates, now);
        assert_eq!(outcome, BatchOutcome { created: 2, skipped: 0 });
    }
}
