pub mod aggregator;
pub mod connections;
pub mod database;
pub mod matcher;
pub mod metrics;
pub mod recurring;
pub mod sync;

pub use aggregator::AggregatorClient;
pub use connections::ConnectionManager;
pub use database::Database;
pub use matcher::Matcher;
pub use recurring::RecurringScheduler;
pub use sync::TransactionSyncService;
