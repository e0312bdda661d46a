//! Transaction sync scheduler.
//!
//! One run walks every `active` connection, pulls booked transactions for
//! each linked account, normalizes them, and ingests them idempotently. A
//! database lease keeps overlapping triggers from running concurrently, and
//! a failure on one connection never stops the others.

use crate::models::{BankConnection, ConnectionStatus, NormalizedTransaction};
use crate::services::aggregator::{AggregatorClient, AggregatorError, RawTransaction};
use crate::services::database::Database;
use crate::services::matcher::Matcher;
use crate::services::metrics::{
    record_connection_transition, record_error, record_movement_ingested, record_sync_run,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SYNC_LEASE_NAME: &str = "transaction-sync";

/// Summary of one sync run, returned to the trigger endpoint.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub connections_visited: u32,
    pub connections_failed: u32,
    pub transactions_seen: u32,
    pub movements_ingested: u32,
    pub movements_skipped_malformed: u32,
}

/// Outcome of a trigger: either a run happened, or another holder's lease
/// was still live.
#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncReport),
    AlreadyRunning,
}

/// Reduce a raw aggregator transaction to the stored shape.
///
/// Returns `None` when the entry cannot be ingested safely: no usable
/// transaction id (idempotency key), no date, or an unparseable amount.
/// Skipped entries are counted, not failed; the next run sees them again.
pub fn normalize_transaction(raw: &RawTransaction) -> Option<NormalizedTransaction> {
    let aggregator_transaction_id = raw
        .transaction_id
        .clone()
        .or_else(|| raw.internal_transaction_id.clone())
        .filter(|id| !id.is_empty())?;

    let booking_date = raw
        .booking_date
        .as_deref()
        .or(raw.value_date.as_deref())
        .and_then(|d| NaiveDate::from_str(d).ok())?;

    let amount = Decimal::from_str(&raw.transaction_amount.amount).ok()?;

    let description = raw
        .remittance_information_unstructured
        .clone()
        .or_else(|| raw.remittance_information_structured.clone())
        .or_else(|| raw.additional_information.clone())
        .unwrap_or_default();

    // The counterparty is whoever is on the other side of the money flow.
    let counterparty = if amount > Decimal::ZERO {
        raw.debtor_name.clone()
    } else {
        raw.creditor_name.clone()
    };

    Some(NormalizedTransaction {
        aggregator_transaction_id,
        booking_date,
        amount,
        currency: raw.transaction_amount.currency.clone(),
        description,
        counterparty,
    })
}

/// The aggregator answers account requests with 403 once the underlying
/// consent has been withdrawn or has lapsed server-side. Every other
/// failure is transient and left for the next run.
pub fn consent_withdrawn(err: &AggregatorError) -> bool {
    matches!(err, AggregatorError::Upstream { status: 403, .. })
}

#[derive(Clone)]
pub struct TransactionSyncService {
    db: Arc<Database>,
    aggregator: Arc<AggregatorClient>,
    matcher: Matcher,
    lease_ttl_secs: i64,
}

impl TransactionSyncService {
    pub fn new(
        db: Arc<Database>,
        aggregator: Arc<AggregatorClient>,
        matcher: Matcher,
        lease_ttl_secs: i64,
    ) -> Self {
        Self {
            db,
            aggregator,
            matcher,
            lease_ttl_secs,
        }
    }

    /// Run one full sync pass under the job lease.
    ///
    /// Cancellation is honored between connections, never mid-connection, so
    /// an interrupted run leaves no connection half-visited.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome, AppError> {
        let holder = Uuid::new_v4();
        if !self
            .db
            .acquire_job_lease(SYNC_LEASE_NAME, holder, self.lease_ttl_secs)
            .await?
        {
            record_sync_run("skipped");
            info!("Sync skipped: another run holds the lease");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let result = self.run_inner(cancel).await;

        // Release regardless of outcome; an expired lease self-heals anyway.
        if let Err(e) = self.db.release_job_lease(SYNC_LEASE_NAME, holder).await {
            warn!(error = %e, "Failed to release sync lease");
        }

        match &result {
            Ok(_) => record_sync_run("success"),
            Err(_) => record_sync_run("error"),
        }

        result.map(SyncOutcome::Completed)
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<SyncReport, AppError> {
        let connections = self.db.list_active_connections().await?;
        let mut report = SyncReport::default();

        info!(connections = connections.len(), "Sync run started");

        for connection in &connections {
            if cancel.is_cancelled() {
                info!(
                    visited = report.connections_visited,
                    "Sync run cancelled between connections"
                );
                break;
            }

            report.connections_visited += 1;

            // Any failure, including stamping the attempt or success
            // timestamps, is scoped to this connection; the rest of the
            // batch still runs.
            if let Err(e) = self.sync_connection(connection, &mut report).await {
                report.connections_failed += 1;
                record_error("connection_sync_failed");
                warn!(
                    connection_id = %connection.connection_id,
                    institution_id = %connection.institution_id,
                    error = %e,
                    "Connection sync failed; continuing with the rest"
                );
            }
        }

        info!(
            visited = report.connections_visited,
            failed = report.connections_failed,
            ingested = report.movements_ingested,
            "Sync run finished"
        );

        Ok(report)
    }

    async fn sync_connection(
        &self,
        connection: &BankConnection,
        report: &mut SyncReport,
    ) -> Result<(), AppError> {
        // The attempt stamp lands regardless of the batch outcome; the
        // success stamp only after every account is processed.
        self.db.record_sync_attempt(connection.connection_id).await?;

        for account_id in &connection.account_ids {
            let transactions = match self.aggregator.list_transactions(account_id).await {
                Ok(transactions) => transactions,
                Err(e) if consent_withdrawn(&e) => {
                    self.db
                        .set_connection_status(connection.connection_id, ConnectionStatus::Revoked)
                        .await?;
                    record_connection_transition(ConnectionStatus::Revoked.as_str());
                    warn!(
                        connection_id = %connection.connection_id,
                        account_id = %account_id,
                        "Consent withdrawn upstream; connection revoked"
                    );
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Consent withdrawn by the bank or the user"
                    )));
                }
                Err(e) => return Err(AppError::BadGateway(e.to_string())),
            };

            for raw in &transactions {
                report.transactions_seen += 1;

                let Some(normalized) = normalize_transaction(raw) else {
                    report.movements_skipped_malformed += 1;
                    record_error("malformed_transaction");
                    warn!(
                        connection_id = %connection.connection_id,
                        account_id = %account_id,
                        "Skipping transaction without id, date or parseable amount"
                    );
                    continue;
                };

                if let Some(movement) = self.db.insert_movement(connection, &normalized).await? {
                    report.movements_ingested += 1;
                    let direction = if movement.amount >= Decimal::ZERO {
                        "incoming"
                    } else {
                        "outgoing"
                    };
                    record_movement_ingested(direction);

                    // Matching a single movement is best-effort; a matcher
                    // failure must not abort ingestion of the rest.
                    if let Err(e) = self.matcher.match_movement(&movement).await {
                        record_error("match_failed");
                        warn!(
                            movement_id = %movement.movement_id,
                            error = %e,
                            "Matching failed for ingested movement"
                        );
                    }
                }
            }
        }

        self.db.record_sync_success(connection.connection_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregator::TransactionAmount;

    fn raw(amount: &str) -> RawTransaction {
        RawTransaction {
            transaction_id: Some("tx-1".to_string()),
            internal_transaction_id: None,
            booking_date: Some("2024-08-01".to_string()),
            value_date: None,
            transaction_amount: TransactionAmount {
                amount: amount.to_string(),
                currency: "EUR".to_string(),
            },
            creditor_name: Some("Hosting Provider".to_string()),
            debtor_name: Some("Acme GmbH".to_string()),
            remittance_information_unstructured: Some("Monthly hosting".to_string()),
            remittance_information_structured: Some("RF18 5390 0754 7034".to_string()),
            additional_information: Some("card payment".to_string()),
        }
    }

    #[test]
    fn normalizes_a_complete_transaction() {
        let normalized = normalize_transaction(&raw("-42.50")).unwrap();
        assert_eq!(normalized.aggregator_transaction_id, "tx-1");
        assert_eq!(
            normalized.booking_date,
            NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()
        );
        assert_eq!(normalized.amount, Decimal::from_str("-42.50").unwrap());
        assert_eq!(normalized.currency, "EUR");
        assert_eq!(normalized.description, "Monthly hosting");
    }

    #[test]
    fn falls_back_to_internal_transaction_id() {
        let mut tx = raw("10.00");
        tx.transaction_id = None;
        tx.internal_transaction_id = Some("int-7".to_string());
        let normalized = normalize_transaction(&tx).unwrap();
        assert_eq!(normalized.aggregator_transaction_id, "int-7");
    }

    #[test]
    fn missing_id_is_skipped() {
        let mut tx = raw("10.00");
        tx.transaction_id = None;
        tx.internal_transaction_id = None;
        assert!(normalize_transaction(&tx).is_none());

        tx.transaction_id = Some(String::new());
        assert!(normalize_transaction(&tx).is_none());
    }

    #[test]
    fn falls_back_to_value_date() {
        let mut tx = raw("10.00");
        tx.booking_date = None;
        tx.value_date = Some("2024-07-30".to_string());
        let normalized = normalize_transaction(&tx).unwrap();
        assert_eq!(
            normalized.booking_date,
            NaiveDate::from_ymd_opt(2024, 7, 30).unwrap()
        );
    }

    #[test]
    fn missing_both_dates_is_skipped() {
        let mut tx = raw("10.00");
        tx.booking_date = None;
        tx.value_date = None;
        assert!(normalize_transaction(&tx).is_none());
    }

    #[test]
    fn unparseable_amount_is_skipped() {
        assert!(normalize_transaction(&raw("not-a-number")).is_none());
    }

    #[test]
    fn description_falls_back_through_remittance_fields() {
        let mut tx = raw("10.00");
        tx.remittance_information_unstructured = None;
        let normalized = normalize_transaction(&tx).unwrap();
        assert_eq!(normalized.description, "RF18 5390 0754 7034");

        tx.remittance_information_structured = None;
        let normalized = normalize_transaction(&tx).unwrap();
        assert_eq!(normalized.description, "card payment");

        tx.additional_information = None;
        let normalized = normalize_transaction(&tx).unwrap();
        assert_eq!(normalized.description, "");
    }

    #[test]
    fn counterparty_follows_the_money_direction() {
        let incoming = normalize_transaction(&raw("120.00")).unwrap();
        assert_eq!(incoming.counterparty.as_deref(), Some("Acme GmbH"));

        let outgoing = normalize_transaction(&raw("-42.50")).unwrap();
        assert_eq!(outgoing.counterparty.as_deref(), Some("Hosting Provider"));
    }

    #[test]
    fn upstream_forbidden_means_consent_withdrawn() {
        let err = AggregatorError::Upstream {
            status: 403,
            body: r#"{"detail":"EUA was revoked"}"#.to_string(),
        };
        assert!(consent_withdrawn(&err));
    }

    #[test]
    fn other_upstream_failures_are_transient() {
        for status in [401, 429, 500, 503] {
            let err = AggregatorError::Upstream {
                status,
                body: String::new(),
            };
            assert!(!consent_withdrawn(&err), "status {status}");
        }

        let decode = AggregatorError::Decode(
            serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
        );
        assert!(!consent_withdrawn(&decode));
    }
}
