//! Activation invariant tests against a real PostgreSQL instance.
//!
//! Run with a database available:
//!   DATABASE_URL=postgres://... cargo test -- --ignored

use banksync_service::models::BankConnection;
use banksync_service::services::Database;
use uuid::Uuid;

async fn test_db() -> Database {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db = Database::new(&url, 5, 1).await.expect("database connection");
    db.run_migrations().await.expect("migrations");
    db
}

async fn pending_connection(db: &Database, tenant_id: Uuid, institution_id: &str) -> BankConnection {
    db.create_connection(
        tenant_id,
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        institution_id,
        "Test Institution",
    )
    .await
    .expect("connection created")
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance via DATABASE_URL"]
async fn activating_a_new_consent_supersedes_the_previous_one_atomically() {
    let db = test_db().await;
    let tenant_id = Uuid::new_v4();
    let institution_id = format!("INST_{}", Uuid::new_v4());

    let first = pending_connection(&db, tenant_id, &institution_id).await;
    let (first_active, superseded) = db
        .activate_connection(&first, &["ACC1".to_string()])
        .await
        .expect("activation")
        .expect("guard fires on pending_consent");
    assert_eq!(first_active.status, "active");
    assert_eq!(superseded, 0);

    let second = pending_connection(&db, tenant_id, &institution_id).await;
    let (second_active, superseded) = db
        .activate_connection(&second, &["ACC2".to_string()])
        .await
        .expect("activation")
        .expect("guard fires on pending_consent");
    assert_eq!(second_active.status, "active");
    assert_eq!(superseded, 1);

    // Exactly one active connection survives for the tenant + institution;
    // the partial unique index rejects any second one.
    let connections = db.list_connections(tenant_id).await.expect("list");
    let active: Vec<_> = connections.iter().filter(|c| c.status == "active").collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].connection_id, second.connection_id);
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance via DATABASE_URL"]
async fn repeated_activation_is_a_guarded_no_op() {
    let db = test_db().await;
    let tenant_id = Uuid::new_v4();
    let institution_id = format!("INST_{}", Uuid::new_v4());

    let connection = pending_connection(&db, tenant_id, &institution_id).await;
    let (activated, _) = db
        .activate_connection(&connection, &["ACC1".to_string()])
        .await
        .expect("activation")
        .expect("guard fires on pending_consent");

    // A racing duplicate callback finds the row already active and the
    // guard does not fire; the stored accounts are untouched.
    let repeat = db
        .activate_connection(&connection, &["ACC_OTHER".to_string()])
        .await
        .expect("activation");
    assert!(repeat.is_none());

    let current = db
        .get_connection_by_requisition(&connection.requisition_id)
        .await
        .expect("lookup")
        .expect("still present");
    assert_eq!(current.account_ids, activated.account_ids);
}
