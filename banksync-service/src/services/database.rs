//! Database service for banksync-service.
//!
//! Every mutating write on a natural key goes through `ON CONFLICT DO
//! NOTHING` (or a status-guarded UPDATE), which is what makes scheduled runs
//! and the consent callback safe to repeat or race.

use crate::models::{
    BankConnection, BankMovement, ConnectionStatus, Invoice, MovementStatus,
    NormalizedTransaction, ObligationCandidate, ObligationKind, RecurringDefinition,
    RecurringInstance,
};
use crate::services::metrics::{record_error, DB_QUERY_DURATION};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const CONNECTION_COLUMNS: &str = "connection_id, tenant_id, requisition_id, reference, \
     institution_id, institution_name, status, account_ids, created_utc, \
     consent_completed_utc, last_synced_utc, last_sync_attempt_utc";

const MOVEMENT_COLUMNS: &str = "movement_id, connection_id, tenant_id, \
     aggregator_transaction_id, booking_date, amount, currency, description, counterparty, \
     status, suggested_obligation_kind, suggested_obligation_id, matched_obligation_kind, \
     matched_obligation_id, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "banksync-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Bank Connection Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id, institution_id = %institution_id))]
    pub async fn create_connection(
        &self,
        tenant_id: Uuid,
        requisition_id: &str,
        reference: &str,
        institution_id: &str,
        institution_name: &str,
    ) -> Result<BankConnection, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_connection"])
            .start_timer();

        let connection = sqlx::query_as::<_, BankConnection>(&format!(
            "INSERT INTO bank_connections \
                 (connection_id, tenant_id, requisition_id, reference, institution_id, institution_name) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {CONNECTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(requisition_id)
        .bind(reference)
        .bind(institution_id)
        .bind(institution_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_err("create_connection", e))?;

        timer.observe_duration();
        info!(connection_id = %connection.connection_id, "Bank connection created");

        Ok(connection)
    }

    pub async fn get_connection_by_requisition(
        &self,
        requisition_id: &str,
    ) -> Result<Option<BankConnection>, AppError> {
        let connection = sqlx::query_as::<_, BankConnection>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM bank_connections WHERE requisition_id = $1"
        ))
        .bind(requisition_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load connection: {}", e))
        })?;

        Ok(connection)
    }

    pub async fn list_connections(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<BankConnection>, AppError> {
        let connections = sqlx::query_as::<_, BankConnection>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM bank_connections \
             WHERE tenant_id = $1 ORDER BY created_utc DESC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list connections: {}", e))
        })?;

        Ok(connections)
    }

    /// All `active` connections across tenants; the sync run visits each.
    pub async fn list_active_connections(&self) -> Result<Vec<BankConnection>, AppError> {
        let connections = sqlx::query_as::<_, BankConnection>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM bank_connections \
             WHERE status = 'active' ORDER BY created_utc"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list active connections: {}", e))
        })?;

        Ok(connections)
    }

    /// Transition a connection to `active` and expire any other `active`
    /// connection for the same tenant and institution, in one transaction.
    /// The activation is guarded so only `pending_consent` rows move;
    /// `None` means the guard did not fire (already active, or terminal).
    /// Returns the activated row and the superseded count.
    #[instrument(skip(self, account_ids), fields(connection_id = %connection.connection_id))]
    pub async fn activate_connection(
        &self,
        connection: &BankConnection,
        account_ids: &[String],
    ) -> Result<Option<(BankConnection, u64)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["activate_connection"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        // Supersede first: the partial unique index on active connections
        // would otherwise reject the activation statement. The filter
        // excludes this row, so a racing duplicate callback cannot expire
        // its own activation.
        let superseded = sqlx::query(
            "UPDATE bank_connections SET status = 'expired' \
             WHERE tenant_id = $1 AND institution_id = $2 \
               AND status = 'active' AND connection_id <> $3",
        )
        .bind(connection.tenant_id)
        .bind(&connection.institution_id)
        .bind(connection.connection_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to supersede connections: {}", e))
        })?
        .rows_affected();

        let activated = sqlx::query_as::<_, BankConnection>(&format!(
            "UPDATE bank_connections \
             SET status = 'active', account_ids = $2, consent_completed_utc = now() \
             WHERE connection_id = $1 AND status = 'pending_consent' \
             RETURNING {CONNECTION_COLUMNS}"
        ))
        .bind(connection.connection_id)
        .bind(account_ids)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_write_err("activate_connection", e))?;

        tx.commit().await?;
        timer.observe_duration();

        Ok(activated.map(|c| (c, superseded)))
    }

    pub async fn set_connection_status(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE bank_connections SET status = $2 WHERE connection_id = $1")
            .bind(connection_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update connection: {}", e))
            })?;
        Ok(())
    }

    pub async fn record_sync_attempt(&self, connection_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE bank_connections SET last_sync_attempt_utc = now() WHERE connection_id = $1",
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record sync attempt: {}", e))
        })?;
        Ok(())
    }

    pub async fn record_sync_success(&self, connection_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE bank_connections SET last_synced_utc = now() WHERE connection_id = $1",
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record sync success: {}", e))
        })?;
        Ok(())
    }

    // =========================================================================
    // Bank Movement Operations
    // =========================================================================

    /// Idempotent ingestion: inserts a movement keyed by
    /// (connection_id, aggregator_transaction_id), returning the new row or
    /// `None` when that transaction was already ingested.
    #[instrument(skip(self, tx), fields(connection_id = %connection.connection_id))]
    pub async fn insert_movement(
        &self,
        connection: &BankConnection,
        tx: &NormalizedTransaction,
    ) -> Result<Option<BankMovement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_movement"])
            .start_timer();

        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "INSERT INTO bank_movements \
                 (movement_id, connection_id, tenant_id, aggregator_transaction_id, \
                  booking_date, amount, currency, description, counterparty) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (connection_id, aggregator_transaction_id) DO NOTHING \
             RETURNING {MOVEMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(connection.connection_id)
        .bind(connection.tenant_id)
        .bind(&tx.aggregator_transaction_id)
        .bind(tx.booking_date)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(&tx.description)
        .bind(&tx.counterparty)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_err("insert_movement", e))?;

        timer.observe_duration();
        Ok(movement)
    }

    pub async fn get_movement(
        &self,
        tenant_id: Uuid,
        movement_id: Uuid,
    ) -> Result<Option<BankMovement>, AppError> {
        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM bank_movements \
             WHERE tenant_id = $1 AND movement_id = $2"
        ))
        .bind(tenant_id)
        .bind(movement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load movement: {}", e)))?;

        Ok(movement)
    }

    pub async fn list_movements(
        &self,
        tenant_id: Uuid,
        status: Option<MovementStatus>,
    ) -> Result<Vec<BankMovement>, AppError> {
        let movements = match status {
            Some(status) => {
                sqlx::query_as::<_, BankMovement>(&format!(
                    "SELECT {MOVEMENT_COLUMNS} FROM bank_movements \
                     WHERE tenant_id = $1 AND status = $2 \
                     ORDER BY booking_date DESC, created_utc DESC"
                ))
                .bind(tenant_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, BankMovement>(&format!(
                    "SELECT {MOVEMENT_COLUMNS} FROM bank_movements \
                     WHERE tenant_id = $1 \
                     ORDER BY booking_date DESC, created_utc DESC"
                ))
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list movements: {}", e)))?;

        Ok(movements)
    }

    /// Record a proposed link. Guarded on `unmatched` so a racing manual
    /// action wins over the matcher.
    pub async fn set_movement_suggestion(
        &self,
        movement_id: Uuid,
        candidate: &ObligationCandidate,
    ) -> Result<Option<BankMovement>, AppError> {
        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "UPDATE bank_movements \
             SET status = 'suggested', suggested_obligation_kind = $2, suggested_obligation_id = $3 \
             WHERE movement_id = $1 AND status = 'unmatched' \
             RETURNING {MOVEMENT_COLUMNS}"
        ))
        .bind(movement_id)
        .bind(candidate.kind)
        .bind(candidate.obligation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record suggestion: {}", e))
        })?;

        Ok(movement)
    }

    /// Confirm a suggested link: transactionally marks the movement
    /// `matched` and settles the obligation it points at. Confirming an
    /// already-`matched` movement is a no-op success.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, movement_id = %movement_id))]
    pub async fn confirm_movement_match(
        &self,
        tenant_id: Uuid,
        movement_id: Uuid,
    ) -> Result<BankMovement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_movement_match"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM bank_movements \
             WHERE tenant_id = $1 AND movement_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(movement_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load movement: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Movement not found")))?;

        match movement.status() {
            MovementStatus::Matched => {
                tx.rollback().await.ok();
                return Ok(movement);
            }
            MovementStatus::Suggested => {}
            _ => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Movement has no pending suggestion to confirm"
                )));
            }
        }

        let kind = movement
            .suggested_obligation_kind
            .as_deref()
            .and_then(ObligationKind::parse)
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!("Movement suggestion is missing its obligation"))
            })?;
        let obligation_id = movement.suggested_obligation_id.ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("Movement suggestion is missing its obligation"))
        })?;

        let settled = match kind {
            ObligationKind::InvoiceReceivable => sqlx::query(
                "UPDATE invoices \
                 SET is_collected = TRUE, collected_by_movement_id = $1 \
                 WHERE invoice_id = $2 AND tenant_id = $3 AND NOT is_collected",
            )
            .bind(movement_id)
            .bind(obligation_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to settle invoice: {}", e))
            })?
            .rows_affected(),
            ObligationKind::RecurringPayable => sqlx::query(
                "UPDATE recurring_instances \
                 SET status = 'paid', paid_by_movement_id = $1 \
                 WHERE instance_id = $2 AND tenant_id = $3 AND status = 'pending'",
            )
            .bind(movement_id)
            .bind(obligation_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to settle instance: {}", e))
            })?
            .rows_affected(),
        };

        if settled == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Suggested obligation was already settled"
            )));
        }

        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "UPDATE bank_movements \
             SET status = 'matched', \
                 matched_obligation_kind = suggested_obligation_kind, \
                 matched_obligation_id = suggested_obligation_id, \
                 suggested_obligation_kind = NULL, suggested_obligation_id = NULL \
             WHERE movement_id = $1 \
             RETURNING {MOVEMENT_COLUMNS}"
        ))
        .bind(movement_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to confirm match: {}", e)))?;

        tx.commit().await?;
        timer.observe_duration();
        info!(movement_id = %movement_id, "Movement match confirmed");

        Ok(movement)
    }

    /// Reject a suggestion: the movement returns to `unmatched` and the
    /// rejected candidate is remembered so it is never re-suggested.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, movement_id = %movement_id))]
    pub async fn reject_movement_suggestion(
        &self,
        tenant_id: Uuid,
        movement_id: Uuid,
    ) -> Result<BankMovement, AppError> {
        let mut tx = self.pool.begin().await?;

        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM bank_movements \
             WHERE tenant_id = $1 AND movement_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(movement_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load movement: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Movement not found")))?;

        if movement.status() != MovementStatus::Suggested {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Movement has no pending suggestion to reject"
            )));
        }

        if let (Some(kind), Some(obligation_id)) = (
            movement.suggested_obligation_kind.as_deref(),
            movement.suggested_obligation_id,
        ) {
            sqlx::query(
                "INSERT INTO rejected_suggestions (movement_id, obligation_kind, obligation_id) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(movement_id)
            .bind(kind)
            .bind(obligation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_err("record_rejection", e))?;
        }

        let movement = sqlx::query_as::<_, BankMovement>(&format!(
            "UPDATE bank_movements \
             SET status = 'unmatched', \
                 suggested_obligation_kind = NULL, suggested_obligation_id = NULL \
             WHERE movement_id = $1 \
             RETURNING {MOVEMENT_COLUMNS}"
        ))
        .bind(movement_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reject suggestion: {}", e))
        })?;

        tx.commit().await?;
        info!(movement_id = %movement_id, "Movement suggestion rejected");

        Ok(movement)
    }

    pub async fn list_rejected_candidates(
        &self,
        movement_id: Uuid,
    ) -> Result<Vec<(String, Uuid)>, AppError> {
        let rows = sqlx::query_as::<_, (String, Uuid)>(
            "SELECT obligation_kind, obligation_id FROM rejected_suggestions \
             WHERE movement_id = $1",
        )
        .bind(movement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list rejections: {}", e))
        })?;

        Ok(rows)
    }

    // =========================================================================
    // Obligation Candidate Search
    // =========================================================================

    /// Open invoices with an exact amount/currency match (incoming money).
    pub async fn find_receivable_candidates(
        &self,
        tenant_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<Vec<ObligationCandidate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_receivable_candidates"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Uuid, String, Decimal, String, NaiveDate)>(
            "SELECT invoice_id, client_name, total_amount, currency, issue_date \
             FROM invoices \
             WHERE tenant_id = $1 AND NOT is_collected \
               AND total_amount = $2 AND currency = $3",
        )
        .bind(tenant_id)
        .bind(amount)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to search invoices: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(
                |(obligation_id, counterparty_name, expected_amount, currency, issue_date)| {
                    ObligationCandidate {
                        obligation_id,
                        kind: ObligationKind::InvoiceReceivable.as_str(),
                        expected_amount,
                        currency,
                        reference_date: issue_date,
                        counterparty_name,
                    }
                },
            )
            .collect())
    }

    /// Pending recurring instances with an exact amount/currency match
    /// (outgoing money).
    pub async fn find_payable_candidates(
        &self,
        tenant_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<Vec<ObligationCandidate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_payable_candidates"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Uuid, String, Decimal, String, NaiveDate)>(
            "SELECT i.instance_id, d.concept, i.amount, i.currency, i.due_date \
             FROM recurring_instances i \
             JOIN recurring_definitions d USING (definition_id) \
             WHERE i.tenant_id = $1 AND i.status = 'pending' \
               AND i.amount = $2 AND i.currency = $3",
        )
        .bind(tenant_id)
        .bind(amount)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to search instances: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(
                |(obligation_id, counterparty_name, expected_amount, currency, due_date)| {
                    ObligationCandidate {
                        obligation_id,
                        kind: ObligationKind::RecurringPayable.as_str(),
                        expected_amount,
                        currency,
                        reference_date: due_date,
                        counterparty_name,
                    }
                },
            )
            .collect())
    }

    // =========================================================================
    // Recurring Obligation Operations
    // =========================================================================

    pub async fn list_active_definitions(&self) -> Result<Vec<RecurringDefinition>, AppError> {
        let definitions = sqlx::query_as::<_, RecurringDefinition>(
            "SELECT definition_id, tenant_id, concept, expected_amount, currency, due_day, \
                    is_active, created_utc \
             FROM recurring_definitions WHERE is_active ORDER BY created_utc",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list definitions: {}", e))
        })?;

        Ok(definitions)
    }

    /// Materialize the instance for (definition, due date). Returns `None`
    /// when it already exists; repeated scheduler runs are harmless.
    #[instrument(skip(self, definition), fields(definition_id = %definition.definition_id, due_date = %due_date))]
    pub async fn upsert_recurring_instance(
        &self,
        definition: &RecurringDefinition,
        due_date: NaiveDate,
    ) -> Result<Option<RecurringInstance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_recurring_instance"])
            .start_timer();

        let instance = sqlx::query_as::<_, RecurringInstance>(
            "INSERT INTO recurring_instances \
                 (instance_id, definition_id, tenant_id, due_date, amount, currency) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (definition_id, due_date) DO NOTHING \
             RETURNING instance_id, definition_id, tenant_id, due_date, amount, currency, \
                       status, paid_by_movement_id, created_utc",
        )
        .bind(Uuid::new_v4())
        .bind(definition.definition_id)
        .bind(definition.tenant_id)
        .bind(due_date)
        .bind(definition.expected_amount)
        .bind(&definition.currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_err("upsert_recurring_instance", e))?;

        timer.observe_duration();
        Ok(instance)
    }

    /// Insert a due-soon notification, deduplicated per
    /// (definition, due date, days-until-due). Returns whether a row was
    /// actually inserted.
    pub async fn insert_due_notification(
        &self,
        definition: &RecurringDefinition,
        due_date: NaiveDate,
        days_until_due: i16,
        message: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO due_notifications \
                 (notification_id, tenant_id, definition_id, due_date, days_until_due, message) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (definition_id, due_date, days_until_due) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(definition.tenant_id)
        .bind(definition.definition_id)
        .bind(due_date)
        .bind(days_until_due)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_err("insert_due_notification", e))?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Job Leases
    // =========================================================================

    /// Try to take the lease for a scheduled job. Returns false when another
    /// holder's lease has not yet expired.
    pub async fn acquire_job_lease(
        &self,
        job_name: &str,
        holder: Uuid,
        ttl_secs: i64,
    ) -> Result<bool, AppError> {
        let acquired = sqlx::query(
            "INSERT INTO job_leases (job_name, holder, expires_utc) \
             VALUES ($1, $2, now() + make_interval(secs => $3::double precision)) \
             ON CONFLICT (job_name) DO UPDATE \
                 SET holder = EXCLUDED.holder, expires_utc = EXCLUDED.expires_utc \
                 WHERE job_leases.expires_utc < now() \
             RETURNING job_name",
        )
        .bind(job_name)
        .bind(holder)
        .bind(ttl_secs as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire job lease: {}", e))
        })?;

        Ok(acquired.is_some())
    }

    pub async fn release_job_lease(&self, job_name: &str, holder: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM job_leases WHERE job_name = $1 AND holder = $2")
            .bind(job_name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to release job lease: {}", e))
            })?;
        Ok(())
    }

    // =========================================================================
    // Invoice Collaborator Access (read-side, for diagnostics)
    // =========================================================================

    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(
            "SELECT invoice_id, tenant_id, client_name, total_amount, currency, issue_date, \
                    is_collected, collected_by_movement_id, created_utc \
             FROM invoices WHERE tenant_id = $1 AND invoice_id = $2",
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load invoice: {}", e)))?;

        Ok(invoice)
    }
}

/// Writes that go through natural-key upserts should never raise a unique
/// violation. One escaping anyway means the natural key is wrong somewhere;
/// it is logged as a defect instead of being swallowed as a generic error.
fn map_write_err(operation: &'static str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            record_error("idempotency_violation");
            tracing::error!(
                operation = operation,
                constraint = ?db_err.constraint(),
                "Idempotency violation: unique constraint raised through a \
                 natural-key upsert; the key design needs review"
            );
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{} failed: {}", operation, e))
}
