use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Status changes that time alone has made due on one resource.
///
/// - Approved booking whose end has passed → Completed
/// - Pending booking whose start has passed → Expired
/// - Available timeslot whose end has passed → Expired
///
/// Everything else, terminal states included, is left alone, so running this
/// twice in a row changes nothing the second time.
pub(crate) fn plan_sweep(rs: &ResourceState, now: NaiveDateTime) -> (Vec<Event>, SweepReport) {
    let mut events = Vec::new();
    let mut report = SweepReport::default();

    // Windows are sorted by date: nothing after today can be due.
    let due = rs.windows.partition_point(|w| w.date <= now.date());
    for window in &rs.windows[..due] {
        let next = match (&window.kind, window.status) {
            (WindowKind::Booking(_), WindowStatus::Approved) if window.ends_at() < now => {
                report.completed += 1;
                WindowStatus::Completed
            }
            (WindowKind::Booking(_), WindowStatus::Pending) if window.starts_at() < now => {
                report.expired += 1;
                WindowStatus::Expired
            }
            (WindowKind::Timeslot, WindowStatus::Available) if window.ends_at() < now => {
                report.expired_slots += 1;
                WindowStatus::Expired
            }
            _ => continue,
        };
        events.push(Event::StatusChanged {
            resource_id: rs.id,
            window_id: window.id,
            status: next,
        });
    }
    (events, report)
}

impl Engine {
    /// One atomic sweeper pass over every resource. Sends no notifications.
    pub async fn run_sweep_now(&self) -> Result<SweepReport, EngineError> {
        let started = Instant::now();
        let now = self.now();
        let ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();

        let mut txn = self.begin(&ids).await?;
        let mut report = SweepReport::default();
        let mut events = Vec::new();
        for rs in txn.resources() {
            let (resource_events, r) = plan_sweep(rs, now);
            events.extend(resource_events);
            report.completed += r.completed;
            report.expired += r.expired;
            report.expired_slots += r.expired_slots;
        }
        txn.stage_all(events);
        txn.commit().await?;

        let sweep = crate::observability::SWEEP_TRANSITIONS_TOTAL;
        metrics::counter!(sweep, "to" => "completed").increment(report.completed as u64);
        metrics::counter!(sweep, "to" => "expired").increment(report.expired as u64);
        metrics::counter!(sweep, "to" => "expired_slot").increment(report.expired_slots as u64);
        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if report.total() > 0 {
            info!(
                completed = report.completed,
                expired = report.expired,
                expired_slots = report.expired_slots,
                "sweep applied"
            );
        } else {
            debug!(resources = ids.len(), "sweep found nothing due");
        }
        Ok(report)
    }

    /// Manual sweeper trigger for administrators.
    pub async fn force_sweep(&self, actor: &Actor) -> Result<SweepReport, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized(format!(
                "{} may not trigger the sweeper",
                actor.identity
            )));
        }
        info!(actor = %actor.identity, "sweep forced");
        self.run_sweep_now().await
    }
}
