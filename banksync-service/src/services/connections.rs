//! Bank connection lifecycle.
//!
//! Owns the consent state machine: `pending_consent` on requisition
//! creation, `active` once the aggregator reports consent fulfilled with at
//! least one account, terminal `expired`/`revoked` on withdrawn consent,
//! and non-terminal `error` when verification fails for any other reason.

use crate::models::{BankConnection, ConnectionStatus};
use crate::services::aggregator::{AggregatorClient, AggregatorError, Requisition};
use crate::services::database::Database;
use crate::services::metrics::{record_connection_transition, record_error};
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No connection record matches the requisition id from the callback.
    #[error("No connection matches requisition '{0}'")]
    NotFound(String),

    /// The aggregator reported a status outside the known set. Surfaced
    /// verbatim for diagnostics; the connection is left in `error`.
    #[error("Aggregator reported unexpected requisition status '{0}'")]
    UnexpectedAggregatorStatus(String),

    /// The requisition came back without a hosted-consent URL; the user
    /// would have nowhere to go, so the start operation fails outright.
    #[error("Aggregator returned no consent link for requisition '{0}'")]
    MissingConsentLink(String),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<ConnectionError> for AppError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::NotFound(_) => AppError::NotFound(anyhow::anyhow!("{}", e)),
            ConnectionError::UnexpectedAggregatorStatus(_)
            | ConnectionError::MissingConsentLink(_) => AppError::BadGateway(e.to_string()),
            ConnectionError::Aggregator(inner) => AppError::BadGateway(inner.to_string()),
            ConnectionError::Storage(inner) => inner,
        }
    }
}

/// What a requisition status code means for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequisitionOutcome {
    /// Consent granted, accounts linked.
    Granted,
    /// Consent flow not finished yet (created, authenticating, selecting).
    InProgress,
    Rejected,
    Expired,
}

/// Maps the aggregator's two-letter requisition codes. Returns `None` for
/// anything outside the documented set.
pub fn map_requisition_status(status: &str) -> Option<RequisitionOutcome> {
    match status {
        "LN" => Some(RequisitionOutcome::Granted),
        "CR" | "GC" | "UA" | "SA" | "GA" => Some(RequisitionOutcome::InProgress),
        "RJ" => Some(RequisitionOutcome::Rejected),
        "EX" => Some(RequisitionOutcome::Expired),
        _ => None,
    }
}

/// Result of `complete_connection`, rendered to the end user by the
/// callback endpoint.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Activated(BankConnection),
    /// Completion called on an already-active connection; no-op success.
    AlreadyActive(BankConnection),
    /// Consent flow not finished; the record stays `pending_consent`.
    StillPending(BankConnection),
    Rejected(BankConnection),
    Expired(BankConnection),
}

#[derive(Clone)]
pub struct ConnectionManager {
    db: Arc<Database>,
    aggregator: Arc<AggregatorClient>,
    redirect_url: String,
}

impl ConnectionManager {
    pub fn new(db: Arc<Database>, aggregator: Arc<AggregatorClient>, redirect_url: String) -> Self {
        Self {
            db,
            aggregator,
            redirect_url,
        }
    }

    /// Start a consent flow: create a requisition with a fresh unique
    /// reference, persist the `pending_consent` record, and hand back the
    /// hosted-consent link the user must visit.
    pub async fn start_connection(
        &self,
        tenant_id: Uuid,
        institution_id: &str,
        institution_name: &str,
    ) -> Result<(BankConnection, String), ConnectionError> {
        let reference = Uuid::new_v4().to_string();

        let requisition = self
            .aggregator
            .create_requisition(institution_id, &self.redirect_url, &reference)
            .await?;

        // Checked before persisting so no connection row exists for a
        // consent flow the user could never enter.
        let link = consent_link(&requisition)?;

        let connection = self
            .db
            .create_connection(
                tenant_id,
                &requisition.id,
                &reference,
                institution_id,
                institution_name,
            )
            .await?;

        record_connection_transition(ConnectionStatus::PendingConsent.as_str());
        tracing::info!(
            connection_id = %connection.connection_id,
            requisition_id = %requisition.id,
            institution_id = %institution_id,
            "Consent flow started"
        );

        Ok((connection, link))
    }

    /// Verify a consent flow after the user returns from the bank.
    ///
    /// Idempotent: completing an already-active connection returns it
    /// unchanged. On consent granted the matching record transitions to
    /// `active` (guarded in SQL, so a racing duplicate callback is
    /// harmless) and any prior `active` connection for the same tenant and
    /// institution is expired.
    pub async fn complete_connection(
        &self,
        requisition_id: &str,
    ) -> Result<CompletionOutcome, ConnectionError> {
        let connection = self
            .db
            .get_connection_by_requisition(requisition_id)
            .await?
            .ok_or_else(|| ConnectionError::NotFound(requisition_id.to_string()))?;

        if connection.status() == ConnectionStatus::Active {
            return Ok(CompletionOutcome::AlreadyActive(connection));
        }

        let requisition = self.aggregator.get_requisition(requisition_id).await?;

        let Some(outcome) = map_requisition_status(&requisition.status) else {
            record_error("unexpected_aggregator_status");
            self.db
                .set_connection_status(connection.connection_id, ConnectionStatus::Error)
                .await?;
            record_connection_transition(ConnectionStatus::Error.as_str());
            return Err(ConnectionError::UnexpectedAggregatorStatus(
                requisition.status,
            ));
        };

        match outcome {
            RequisitionOutcome::Granted => {
                if requisition.accounts.is_empty() {
                    // Consent without a single linked account cannot be
                    // synced; treat as a verification failure the user may
                    // retry.
                    self.db
                        .set_connection_status(connection.connection_id, ConnectionStatus::Error)
                        .await?;
                    record_connection_transition(ConnectionStatus::Error.as_str());
                    return Err(ConnectionError::UnexpectedAggregatorStatus(format!(
                        "{} (no accounts linked)",
                        requisition.status
                    )));
                }

                match self
                    .db
                    .activate_connection(&connection, &requisition.accounts)
                    .await?
                {
                    Some((activated, superseded)) => {
                        record_connection_transition(ConnectionStatus::Active.as_str());
                        tracing::info!(
                            connection_id = %activated.connection_id,
                            accounts = activated.account_ids.len(),
                            superseded = superseded,
                            "Connection activated"
                        );
                        Ok(CompletionOutcome::Activated(activated))
                    }
                    None => {
                        // The guard did not fire: a concurrent completion got
                        // there first. Re-read and report the settled state.
                        let current = self
                            .db
                            .get_connection_by_requisition(requisition_id)
                            .await?
                            .ok_or_else(|| {
                                ConnectionError::NotFound(requisition_id.to_string())
                            })?;
                        Ok(CompletionOutcome::AlreadyActive(current))
                    }
                }
            }
            RequisitionOutcome::InProgress => Ok(CompletionOutcome::StillPending(connection)),
            RequisitionOutcome::Rejected => {
                self.db
                    .set_connection_status(connection.connection_id, ConnectionStatus::Error)
                    .await?;
                record_connection_transition(ConnectionStatus::Error.as_str());
                tracing::warn!(
                    connection_id = %connection.connection_id,
                    "Consent rejected by the user or the bank"
                );
                let current = refreshed(&self.db, requisition_id, connection).await;
                Ok(CompletionOutcome::Rejected(current))
            }
            RequisitionOutcome::Expired => {
                self.db
                    .set_connection_status(connection.connection_id, ConnectionStatus::Expired)
                    .await?;
                record_connection_transition(ConnectionStatus::Expired.as_str());
                let current = refreshed(&self.db, requisition_id, connection).await;
                Ok(CompletionOutcome::Expired(current))
            }
        }
    }
}

/// The hosted-consent URL from a freshly created requisition.
fn consent_link(requisition: &Requisition) -> Result<String, ConnectionError> {
    requisition
        .link
        .as_deref()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConnectionError::MissingConsentLink(requisition.id.clone()))
}

async fn refreshed(
    db: &Database,
    requisition_id: &str,
    fallback: BankConnection,
) -> BankConnection {
    db.get_connection_by_requisition(requisition_id)
        .await
        .ok()
        .flatten()
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_status_means_granted() {
        assert_eq!(
            map_requisition_status("LN"),
            Some(RequisitionOutcome::Granted)
        );
    }

    #[test]
    fn intermediate_statuses_are_in_progress() {
        for code in ["CR", "GC", "UA", "SA", "GA"] {
            assert_eq!(
                map_requisition_status(code),
                Some(RequisitionOutcome::InProgress),
                "code {code}"
            );
        }
    }

    #[test]
    fn terminal_failures_map_to_their_outcomes() {
        assert_eq!(
            map_requisition_status("RJ"),
            Some(RequisitionOutcome::Rejected)
        );
        assert_eq!(
            map_requisition_status("EX"),
            Some(RequisitionOutcome::Expired)
        );
    }

    #[test]
    fn unknown_status_is_not_guessed() {
        assert_eq!(map_requisition_status("ZZ"), None);
        assert_eq!(map_requisition_status(""), None);
    }

    fn requisition(link: Option<&str>) -> Requisition {
        Requisition {
            id: "req-1".to_string(),
            status: "CR".to_string(),
            institution_id: "INST_X".to_string(),
            reference: None,
            link: link.map(str::to_string),
            accounts: vec![],
        }
    }

    #[test]
    fn present_consent_link_is_passed_through() {
        let link = consent_link(&requisition(Some("https://consent.example/start"))).unwrap();
        assert_eq!(link, "https://consent.example/start");
    }

    #[test]
    fn missing_or_blank_consent_link_fails_the_start() {
        assert!(matches!(
            consent_link(&requisition(None)),
            Err(ConnectionError::MissingConsentLink(_))
        ));
        assert!(matches!(
            consent_link(&requisition(Some(""))),
            Err(ConnectionError::MissingConsentLink(_))
        ));
    }
}
