//! Recurring obligation scheduler.
//!
//! Each run projects every active definition onto its next due date,
//! materializes an instance when that date is at most three days out, and
//! emits due-soon notifications at exactly three days and on the due day.
//! All writes are keyed so repeated runs within the same day are no-ops.

use crate::models::RecurringDefinition;
use crate::services::database::Database;
use crate::services::metrics::{record_error, record_recurring_action};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const RECURRING_LEASE_NAME: &str = "recurring-check";

/// Days ahead at which an instance is materialized and the first
/// notification fires.
const DUE_SOON_HORIZON_DAYS: i64 = 3;

#[derive(Debug, Default, Serialize)]
pub struct RecurringReport {
    pub definitions_checked: u32,
    pub definitions_failed: u32,
    pub instances_created: u32,
    pub notifications_sent: u32,
}

#[derive(Debug)]
pub enum RecurringOutcome {
    Completed(RecurringReport),
    AlreadyRunning,
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// The next date a day-of-month obligation falls due, seen from `today`.
///
/// The configured day is clamped to the month's length (a day-31 rent in
/// February is due on the 28th or 29th). A due day already behind us this
/// month projects onto next month, so a late scheduler run never produces
/// an instance that was born overdue.
pub fn upcoming_due_date(due_day: i16, today: NaiveDate) -> NaiveDate {
    let due_day = u32::from(due_day.clamp(1, 31) as u16);

    let clamped = |year: i32, month: u32| {
        let day = due_day.min(days_in_month(year, month));
        // day >= 1 and <= month length, so the date always exists.
        NaiveDate::from_ymd_opt(year, month, day).unwrap_or(today)
    };

    let this_month = clamped(today.year(), today.month());
    if this_month >= today {
        this_month
    } else if today.month() == 12 {
        clamped(today.year() + 1, 1)
    } else {
        clamped(today.year(), today.month() + 1)
    }
}

#[derive(Clone)]
pub struct RecurringScheduler {
    db: Arc<Database>,
    lease_ttl_secs: i64,
}

impl RecurringScheduler {
    pub fn new(db: Arc<Database>, lease_ttl_secs: i64) -> Self {
        Self { db, lease_ttl_secs }
    }

    /// Run one scheduler pass for `today` under the job lease.
    #[instrument(skip(self))]
    pub async fn run(&self, today: NaiveDate) -> Result<RecurringOutcome, AppError> {
        let holder = Uuid::new_v4();
        if !self
            .db
            .acquire_job_lease(RECURRING_LEASE_NAME, holder, self.lease_ttl_secs)
            .await?
        {
            info!("Recurring check skipped: another run holds the lease");
            return Ok(RecurringOutcome::AlreadyRunning);
        }

        let result = self.run_inner(today).await;

        if let Err(e) = self.db.release_job_lease(RECURRING_LEASE_NAME, holder).await {
            warn!(error = %e, "Failed to release recurring lease");
        }

        result.map(RecurringOutcome::Completed)
    }

    async fn run_inner(&self, today: NaiveDate) -> Result<RecurringReport, AppError> {
        let definitions = self.db.list_active_definitions().await?;
        let mut report = RecurringReport::default();

        info!(definitions = definitions.len(), %today, "Recurring check started");

        for definition in &definitions {
            report.definitions_checked += 1;

            // One broken definition must not starve the rest.
            if let Err(e) = self.check_definition(definition, today, &mut report).await {
                report.definitions_failed += 1;
                record_error("recurring_check_failed");
                warn!(
                    definition_id = %definition.definition_id,
                    error = %e,
                    "Recurring check failed for definition"
                );
            }
        }

        info!(
            checked = report.definitions_checked,
            instances = report.instances_created,
            notifications = report.notifications_sent,
            "Recurring check finished"
        );

        Ok(report)
    }

    async fn check_definition(
        &self,
        definition: &RecurringDefinition,
        today: NaiveDate,
        report: &mut RecurringReport,
    ) -> Result<(), AppError> {
        let due_date = upcoming_due_date(definition.due_day, today);
        let days_until_due = (due_date - today).num_days();

        if days_until_due > DUE_SOON_HORIZON_DAYS {
            return Ok(());
        }

        // The instance upsert and the notification are independent writes:
        // a failure in one must not block the other.
        let mut first_err = None;

        match self.db.upsert_recurring_instance(definition, due_date).await {
            Ok(Some(_)) => {
                report.instances_created += 1;
                record_recurring_action("instance_created");
                info!(
                    definition_id = %definition.definition_id,
                    %due_date,
                    "Recurring instance materialized"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    definition_id = %definition.definition_id,
                    error = %e,
                    "Instance upsert failed"
                );
                first_err = Some(e);
            }
        }

        // Notifications fire only at the horizon and on the due day; a run
        // landing at 1 or 2 days out creates the instance silently.
        if days_until_due == DUE_SOON_HORIZON_DAYS || days_until_due == 0 {
            let message = if days_until_due == 0 {
                format!(
                    "{} ({} {}) is due today",
                    definition.concept, definition.expected_amount, definition.currency
                )
            } else {
                format!(
                    "{} ({} {}) is due in {} days",
                    definition.concept,
                    definition.expected_amount,
                    definition.currency,
                    days_until_due
                )
            };

            match self
                .db
                .insert_due_notification(definition, due_date, days_until_due as i16, &message)
                .await
            {
                Ok(true) => {
                    report.notifications_sent += 1;
                    record_recurring_action("notification_sent");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        definition_id = %definition.definition_id,
                        error = %e,
                        "Due notification insert failed"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn due_day_later_this_month_stays_in_this_month() {
        assert_eq!(upcoming_due_date(25, date(2024, 8, 10)), date(2024, 8, 25));
    }

    #[test]
    fn due_day_today_is_due_today() {
        assert_eq!(upcoming_due_date(10, date(2024, 8, 10)), date(2024, 8, 10));
    }

    #[test]
    fn passed_due_day_projects_to_next_month() {
        assert_eq!(upcoming_due_date(5, date(2024, 8, 10)), date(2024, 9, 5));
    }

    #[test]
    fn passed_due_day_in_december_wraps_the_year() {
        assert_eq!(upcoming_due_date(5, date(2024, 12, 10)), date(2025, 1, 5));
    }

    #[test]
    fn due_day_clamps_to_short_months() {
        // Day 31 in September lands on the 30th.
        assert_eq!(upcoming_due_date(31, date(2024, 9, 1)), date(2024, 9, 30));
    }

    #[test]
    fn due_day_clamps_in_february() {
        assert_eq!(upcoming_due_date(30, date(2024, 2, 1)), date(2024, 2, 29));
        assert_eq!(upcoming_due_date(30, date(2023, 2, 1)), date(2023, 2, 28));
    }

    #[test]
    fn clamping_applies_to_the_projected_month_too() {
        // Past day 31 in January projects onto February, clamped.
        assert_eq!(upcoming_due_date(31, date(2024, 2, 15)), date(2024, 2, 29));
        assert_eq!(upcoming_due_date(30, date(2024, 1, 31)), date(2024, 2, 29));
    }

    #[test]
    fn month_lengths_are_correct() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }
}
