//! Cron scheduler
//!
//! Each tick computes the cron firings strictly between the last observed
//! time and now, and starts one workflow per firing under the deterministic
//! id `sched-<name>-<firing time, RFC 3339>`. The id is the idempotency
//! mechanism: a crash-restarted scheduler re-deriving the same firing gets
//! the existing workflow back instead of a duplicate.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::executor::RuntimeInner;
use crate::error::DurableError;

/// Input handed to every scheduled workflow invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledInvocation {
    /// The nominal cron firing time
    pub scheduled_time: DateTime<Utc>,
    /// When the scheduler actually started the workflow
    pub actual_start_time: DateTime<Utc>,
}

/// A registered (cron, workflow) pair
pub(crate) struct ScheduleEntry {
    pub(crate) workflow_name: String,
    schedule: Schedule,
}

impl ScheduleEntry {
    pub(crate) fn parse(workflow_name: &str, cron_expression: &str) -> Result<Self, DurableError> {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            DurableError::Configuration(format!(
                "invalid cron expression {cron_expression:?}: {e}"
            ))
        })?;
        Ok(Self {
            workflow_name: workflow_name.to_string(),
            schedule,
        })
    }

    pub(crate) fn id_prefix(&self) -> String {
        format!("sched-{}-", self.workflow_name)
    }

    pub(crate) fn firing_id(&self, firing: DateTime<Utc>) -> String {
        format!("sched-{}-{}", self.workflow_name, firing.to_rfc3339())
    }

    /// Firings strictly after `last` up to and including `until`, capped at
    /// `cap` occurrences; the boolean reports whether the cap truncated the
    /// backlog
    pub(crate) fn firings_between(
        &self,
        last: DateTime<Utc>,
        until: DateTime<Utc>,
        cap: usize,
    ) -> (Vec<DateTime<Utc>>, bool) {
        let mut firings: Vec<DateTime<Utc>> = self
            .schedule
            .after(&last)
            .take_while(|t| *t <= until)
            .take(cap + 1)
            .collect();
        let truncated = firings.len() > cap;
        firings.truncate(cap);
        (firings, truncated)
    }
}

/// Drive all registered schedules until shutdown
pub(crate) async fn run_scheduler(
    inner: Arc<RuntimeInner>,
    entries: Vec<ScheduleEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let horizon = inner.config.catchup_horizon.max(1) as usize;

    // Backfill origin: the last recorded firing for each schedule, so a
    // restart continues where the previous process stopped.
    let mut last_fired: Vec<DateTime<Utc>> = Vec::with_capacity(entries.len());
    for entry in &entries {
        let origin = match inner
            .sysdb
            .latest_creation_with_prefix(&entry.id_prefix())
            .await
        {
            Ok(Some(created_ms)) => Utc
                .timestamp_millis_opt(created_ms)
                .single()
                .unwrap_or_else(Utc::now),
            Ok(None) => Utc::now(),
            Err(e) => {
                error!(
                    workflow = %entry.workflow_name,
                    "failed to read last firing, starting from now: {}", e
                );
                Utc::now()
            }
        };
        last_fired.push(origin);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                for (entry, last) in entries.iter().zip(last_fired.iter_mut()) {
                    let (firings, truncated) = entry.firings_between(*last, now, horizon);
                    if truncated {
                        warn!(
                            workflow = %entry.workflow_name,
                            horizon,
                            "cron backlog exceeds catch-up horizon, dropping excess firings"
                        );
                    }

                    for firing in firings {
                        fire(&inner, entry, firing, now).await;
                    }
                    *last = now;
                }
            }
            _ = shutdown.changed() => {
                debug!("scheduler: shutdown requested");
                break;
            }
        }
    }

    info!("scheduler exited");
}

async fn fire(
    inner: &Arc<RuntimeInner>,
    entry: &ScheduleEntry,
    firing: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let workflow_id = entry.firing_id(firing);
    let invocation = ScheduledInvocation {
        scheduled_time: firing,
        actual_start_time: now,
    };
    let inputs = match serde_json::to_string(&invocation) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("failed to serialize scheduled invocation: {}", e);
            return;
        }
    };

    debug!(workflow = %entry.workflow_name, %workflow_id, "cron firing");
    match inner
        .start_by_name::<serde_json::Value>(
            &entry.workflow_name,
            workflow_id,
            crate::engine::StartOptions::default(),
            inputs,
            false,
        )
        .await
    {
        // The second start for an id the previous process already fired is
        // a no-op returning the existing handle
        Ok(_handle) => {}
        Err(e) => {
            error!(workflow = %entry.workflow_name, "cron firing failed to start: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().expect("should parse timestamp")
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ScheduleEntry::parse("tick", "not a cron").is_err());
        assert!(ScheduleEntry::parse("tick", "* * * * * *").is_ok());
    }

    #[test]
    fn test_firing_id_is_deterministic() {
        let entry = ScheduleEntry::parse("report", "0 0 * * * *").unwrap();
        let t = utc("2024-05-01T12:00:00Z");
        assert_eq!(entry.firing_id(t), entry.firing_id(t));
        assert_eq!(entry.firing_id(t), "sched-report-2024-05-01T12:00:00+00:00");
        assert_eq!(entry.id_prefix(), "sched-report-");
    }

    #[test]
    fn test_firings_between() {
        // Every minute on the minute
        let entry = ScheduleEntry::parse("tick", "0 * * * * *").unwrap();
        let (firings, truncated) = entry.firings_between(
            utc("2024-05-01T12:00:30Z"),
            utc("2024-05-01T12:03:10Z"),
            100,
        );

        assert!(!truncated);
        assert_eq!(
            firings,
            vec![
                utc("2024-05-01T12:01:00Z"),
                utc("2024-05-01T12:02:00Z"),
                utc("2024-05-01T12:03:00Z"),
            ]
        );
    }

    #[test]
    fn test_catchup_horizon_truncates() {
        let entry = ScheduleEntry::parse("tick", "* * * * * *").unwrap();
        // A minute of backlog at one firing per second, capped at 5
        let (firings, truncated) = entry.firings_between(
            utc("2024-05-01T12:00:00Z"),
            utc("2024-05-01T12:01:00Z"),
            5,
        );

        assert!(truncated);
        assert_eq!(firings.len(), 5);
        assert_eq!(firings[0], utc("2024-05-01T12:00:01Z"));
    }

    #[test]
    fn test_no_firings_before_schedule() {
        let entry = ScheduleEntry::parse("tick", "0 * * * * *").unwrap();
        let (firings, _) = entry.firings_between(
            utc("2024-05-01T12:00:01Z"),
            utc("2024-05-01T12:00:59Z"),
            10,
        );
        assert!(firings.is_empty());
    }
}
