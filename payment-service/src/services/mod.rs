pub mod daraja;
pub mod metrics;
pub mod reconciliation;
pub mod settlement;
pub mod store;

pub use daraja::DarajaClient;
pub use reconciliation::Reconciler;
pub use store::{MongoOrderStore, OrderStore};
