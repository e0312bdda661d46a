//! Domain models for banksync-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Bank Connection Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    PendingConsent,
    Active,
    Expired,
    Revoked,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingConsent => "pending_consent",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending_consent" => Self::PendingConsent,
            "active" => Self::Active,
            "expired" => Self::Expired,
            "revoked" => Self::Revoked,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BankConnection {
    pub connection_id: Uuid,
    pub tenant_id: Uuid,
    /// Aggregator-issued requisition id for this consent flow.
    pub requisition_id: String,
    /// Unique reference generated at creation, echoed back by the aggregator.
    pub reference: String,
    pub institution_id: String,
    pub institution_name: String,
    pub status: String,
    /// Account identifiers returned once consent completes.
    pub account_ids: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub consent_completed_utc: Option<DateTime<Utc>>,
    pub last_synced_utc: Option<DateTime<Utc>>,
    pub last_sync_attempt_utc: Option<DateTime<Utc>>,
}

impl BankConnection {
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::parse(&self.status)
    }
}

// ============================================================================
// Bank Movement Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementStatus {
    Unmatched,
    Suggested,
    Matched,
    Ignored,
}

impl MovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Suggested => "suggested",
            Self::Matched => "matched",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "suggested" => Self::Suggested,
            "matched" => Self::Matched,
            "ignored" => Self::Ignored,
            _ => Self::Unmatched,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BankMovement {
    pub movement_id: Uuid,
    pub connection_id: Uuid,
    pub tenant_id: Uuid,
    pub aggregator_transaction_id: String,
    pub booking_date: NaiveDate,
    /// Signed amount: positive is incoming, negative outgoing.
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub counterparty: Option<String>,
    pub status: String,
    pub suggested_obligation_kind: Option<String>,
    pub suggested_obligation_id: Option<Uuid>,
    pub matched_obligation_kind: Option<String>,
    pub matched_obligation_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl BankMovement {
    pub fn status(&self) -> MovementStatus {
        MovementStatus::parse(&self.status)
    }
}

/// A raw aggregator transaction reduced to the fields this service stores.
/// Produced by the sync scheduler's normalization step, before upsert.
#[derive(Debug, Clone)]
pub struct NormalizedTransaction {
    pub aggregator_transaction_id: String,
    pub booking_date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub counterparty: Option<String>,
}

// ============================================================================
// Obligation Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationKind {
    InvoiceReceivable,
    RecurringPayable,
}

impl ObligationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceReceivable => "invoice_receivable",
            Self::RecurringPayable => "recurring_payable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice_receivable" => Some(Self::InvoiceReceivable),
            "recurring_payable" => Some(Self::RecurringPayable),
            _ => None,
        }
    }
}

/// A view over invoices and recurring instances the matcher searches.
/// Not persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObligationCandidate {
    pub obligation_id: Uuid,
    pub kind: &'static str,
    pub expected_amount: Decimal,
    pub currency: String,
    /// Due date for recurring instances, issue date for invoices.
    pub reference_date: NaiveDate,
    pub counterparty_name: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_name: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub is_collected: bool,
    pub collected_by_movement_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Recurring Obligation Models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecurringDefinition {
    pub definition_id: Uuid,
    pub tenant_id: Uuid,
    pub concept: String,
    pub expected_amount: Decimal,
    pub currency: String,
    /// Day of month the obligation falls due, 1..=31.
    pub due_day: i16,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Paid,
    Overdue,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "overdue" => Self::Overdue,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecurringInstance {
    pub instance_id: Uuid,
    pub definition_id: Uuid,
    pub tenant_id: Uuid,
    pub due_date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub paid_by_movement_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}
