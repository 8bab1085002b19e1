// Feed supervision and drift repair
pub mod reconcile;
pub mod supervisor;

pub use reconcile::{ReconcileReport, ReconciliationLoop};
pub use supervisor::{FeedHealth, FeedSupervisor, FeedTemplate};
