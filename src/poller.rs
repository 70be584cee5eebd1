//! Adaptive polling over active registration plans.
//!
//! Woken on a uniform external cadence; per plan, polls only when the latest
//! detection-log entry is staler than the tier interval for its distance from
//! the target window. The guard is optimistic: overlapping ticks may both
//! probe the same plan, which costs one extra request and nothing else,
//! because log writes are append-only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::SignalClassifier;
use crate::db::Database;
use crate::error::Result;
use crate::executor::AttemptExecutor;
use crate::plan::{DetectionLogEntry, DetectionSignal, PlanStatus, RegistrationPlan};
use crate::window::{SeasonFallback, TargetWindow, resolve_window};

/// Minutes that must have elapsed since the last probe before the next one.
///
/// Tightest (1 minute) within ±1 hour of the window; widening to 5 and then
/// 15 minutes with distance on both sides. Polling continues at low frequency
/// after the window so a wrong guess self-heals instead of giving up.
pub fn required_gap_minutes(window: &TargetWindow, now: DateTime<Utc>) -> i64 {
    let until_start = (window.start - now).num_minutes();
    let since_end = (now - window.end).num_minutes();

    if until_start > 2880 {
        15
    } else if until_start > 60 {
        5
    } else if since_end <= 60 {
        1
    } else if since_end <= 120 {
        5
    } else {
        15
    }
}

/// Counters for one tick, logged and exposed on the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollSummary {
    pub examined: usize,
    pub probed: usize,
    pub skipped: usize,
    pub opens: usize,
    pub errors: usize,
}

pub struct Poller {
    db: Arc<dyn Database>,
    classifier: SignalClassifier,
    executor: Arc<dyn AttemptExecutor>,
    fallback: Arc<dyn SeasonFallback>,
}

impl Poller {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: SignalClassifier,
        executor: Arc<dyn AttemptExecutor>,
        fallback: Arc<dyn SeasonFallback>,
    ) -> Self {
        Self {
            db,
            classifier,
            executor,
            fallback,
        }
    }

    /// One pass over all pollable plans.
    ///
    /// Per-plan failures are logged and counted, never propagated: the next
    /// tick and the idempotent log reads protect correctness.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let plans = self.db.list_pollable_plans().await?;
        let mut summary = PollSummary {
            examined: plans.len(),
            ..Default::default()
        };

        for plan in plans {
            match self.poll_plan(&plan, now).await {
                Ok(Polled::Probed(signal)) => {
                    summary.probed += 1;
                    match signal {
                        DetectionSignal::OpenDetected => summary.opens += 1,
                        DetectionSignal::Error => summary.errors += 1,
                        DetectionSignal::ClosedDetected => {}
                    }
                }
                Ok(Polled::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(plan_id = %plan.id, error = %e, "poll failed");
                }
            }
        }

        tracing::debug!(
            examined = summary.examined,
            probed = summary.probed,
            skipped = summary.skipped,
            opens = summary.opens,
            errors = summary.errors,
            "poll tick complete"
        );
        Ok(summary)
    }

    async fn poll_plan(&self, plan: &RegistrationPlan, now: DateTime<Utc>) -> Result<Polled> {
        let Some(url) = plan.detection_url.as_deref() else {
            return Ok(Polled::Skipped);
        };

        let window = resolve_window(plan, now, self.fallback.as_ref());
        let gap = required_gap_minutes(&window, now);

        if let Some(latest) = self.db.latest_detection(plan.id).await?
            && (now - latest.observed_at).num_minutes() < gap
        {
            return Ok(Polled::Skipped);
        }

        let observation = self.classifier.probe(url).await;
        // One entry per probe, errors included, so the staleness guard
        // converges during provider outages.
        self.db
            .append_detection(&DetectionLogEntry::new(
                plan.id,
                now,
                observation.signal,
                &observation.evidence,
            ))
            .await?;

        if observation.signal == DetectionSignal::OpenDetected {
            self.dispatch_attempt(plan).await?;
        }

        Ok(Polled::Probed(observation.signal))
    }

    /// Hand an open plan to the executor and retire it. The status flip only
    /// happens after a successful dispatch, so a failed launch is retried on
    /// the next tick while the attempt itself stays at-most-once.
    async fn dispatch_attempt(&self, plan: &RegistrationPlan) -> Result<()> {
        let session_id = Uuid::new_v4();
        tracing::info!(
            plan_id = %plan.id,
            session_ref = %plan.session_ref,
            session_id = %session_id,
            "open signal detected, dispatching attempt"
        );

        if let Err(e) = self.executor.launch(plan.id, session_id).await {
            tracing::error!(plan_id = %plan.id, error = %e, "attempt dispatch failed");
            return Ok(());
        }

        self.db.update_plan_status(plan.id, PlanStatus::Done).await?;
        Ok(())
    }

    /// Tick loop on a fixed cadence; runs until the task is aborted.
    pub async fn run(self: Arc<Self>, every: std::time::Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!(error = %e, "poll tick failed");
            }
        }
    }
}

enum Polled {
    Probed(DetectionSignal),
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowConfidence;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> TargetWindow {
        TargetWindow {
            start,
            end,
            confidence: WindowConfidence::Explicit,
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn tier_boundaries_hold_exactly() {
        let w = window(ts("2026-06-01T09:00:00Z"), ts("2026-06-01T11:00:00Z"));

        // Far ahead of the window.
        assert_eq!(required_gap_minutes(&w, w.start - Duration::minutes(2881)), 15);
        // Exactly 48h out drops to the 5-minute tier.
        assert_eq!(required_gap_minutes(&w, w.start - Duration::minutes(2880)), 5);
        assert_eq!(required_gap_minutes(&w, w.start - Duration::minutes(61)), 5);
        // Exactly 1h out drops to the 1-minute tier.
        assert_eq!(required_gap_minutes(&w, w.start - Duration::minutes(60)), 1);
        assert_eq!(required_gap_minutes(&w, w.start), 1);
        assert_eq!(required_gap_minutes(&w, w.end), 1);
        // Up to 1h past the end stays tight.
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(60)), 1);
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(61)), 5);
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(120)), 5);
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(121)), 15);
    }

    #[test]
    fn interval_never_widens_toward_the_window() {
        let w = window(ts("2026-06-01T09:00:00Z"), ts("2026-06-01T11:00:00Z"));
        let mut last = i64::MAX;
        // Walk from 4 days out to the window start.
        for minutes_out in (0..=5760).rev() {
            let gap = required_gap_minutes(&w, w.start - Duration::minutes(minutes_out));
            assert!(
                gap <= last,
                "gap widened from {} to {} at {} minutes out",
                last,
                gap,
                minutes_out
            );
            last = gap;
        }
    }

    #[test]
    fn imminent_manual_open_selects_tightest_tier() {
        let now = ts("2026-06-01T08:30:00Z");
        let open_at = now + Duration::minutes(30);
        let w = window(open_at - Duration::hours(1), open_at + Duration::hours(1));

        assert_eq!(required_gap_minutes(&w, now), 1);
        // Two hours after the window passes: 5-minute tier.
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(90)), 5);
        // Then back to the coarse tier.
        assert_eq!(required_gap_minutes(&w, w.end + Duration::minutes(180)), 15);
    }
}
