//! Schedule-triggered rules.
//!
//! A ticker polls active `schedule` rules every N seconds. A rule whose
//! `next_fire_at` has passed gets one `schedule.fired` queue item, then its
//! `next_fire_at` moves to the next cron occurrence. Missed occurrences
//! while the process was down collapse into a single firing.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::pipeline::types::QueueEvent;
use crate::queue::ActionQueue;
use crate::rules::TriggerType;
use crate::store::Database;

/// Parse a cron expression and compute the first fire time after `after`.
pub fn next_fire(schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    cron_schedule
        .after(&after)
        .next()
        .ok_or_else(|| format!("cron '{schedule}' has no upcoming occurrence"))
}

/// Enqueue every due schedule rule and advance its next fire time.
///
/// Rules seen for the first time (no `next_fire_at`) are armed without firing.
/// Returns the number of items enqueued.
pub async fn fire_due_schedules(
    store: &dyn Database,
    queue: &ActionQueue,
    now: DateTime<Utc>,
) -> Result<usize, QueueError> {
    let rules = store.list_active_rules(TriggerType::Schedule).await?;
    let mut fired = 0;

    for rule in rules {
        let Some(schedule) = rule.trigger_config.schedule.as_deref() else {
            warn!(rule = %rule.name, "Schedule rule has no cron expression");
            continue;
        };
        let next = match next_fire(schedule, now) {
            Ok(next) => next,
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "Skipping schedule rule");
                continue;
            }
        };

        match rule.next_fire_at {
            None => {
                store.set_rule_next_fire(rule.id, Some(next)).await?;
                debug!(rule = %rule.name, next = %next, "Armed schedule rule");
            }
            Some(due) if due <= now => {
                let event = QueueEvent::Schedule {
                    rule_id: rule.id,
                    fired_at: due,
                };
                let item_id = queue.enqueue_event(&event).await?;
                store.set_rule_next_fire(rule.id, Some(next)).await?;
                info!(rule = %rule.name, item_id = %item_id, next = %next, "Schedule rule fired");
                fired += 1;
            }
            Some(_) => {}
        }
    }

    Ok(fired)
}

/// Spawn the schedule ticker background task.
pub fn spawn_schedule_ticker(
    store: Arc<dyn Database>,
    queue: ActionQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = fire_due_schedules(store.as_ref(), &queue, Utc::now()).await {
                        error!(error = %e, "Schedule check failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Schedule ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::store::LibSqlBackend;
    use chrono::TimeZone;

    #[test]
    fn next_fire_valid() {
        let after = Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap();
        let next = next_fire("0 0 9 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_invalid() {
        assert!(next_fire("not a cron", Utc::now()).is_err());
    }

    #[tokio::test]
    async fn arms_then_fires_once() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(Arc::clone(&store), 3);
        let rule = Rule::new("morning digest", "owner", TriggerType::Schedule)
            .with_schedule("0 0 9 * * *");
        store.save_rule(&rule).await.unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(fire_due_schedules(store.as_ref(), &queue, t0).await.unwrap(), 0);
        let armed = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(
            armed.next_fire_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
        );

        // Two days late: one firing, not three.
        let late = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();
        assert_eq!(fire_due_schedules(store.as_ref(), &queue, late).await.unwrap(), 1);
        assert_eq!(fire_due_schedules(store.as_ref(), &queue, late).await.unwrap(), 0);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        let advanced = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(
            advanced.next_fire_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn inactive_schedule_never_fires() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(Arc::clone(&store), 3);
        let mut rule = Rule::new("paused", "owner", TriggerType::Schedule)
            .with_schedule("* * * * * *")
            .inactive();
        rule.next_fire_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.save_rule(&rule).await.unwrap();

        assert_eq!(
            fire_due_schedules(store.as_ref(), &queue, Utc::now()).await.unwrap(),
            0
        );
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }
}
