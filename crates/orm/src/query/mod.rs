//! Query Module - deferred finds, ordering, condition checks and aggregates

pub mod aggregate;
pub mod chain;
pub mod conditions;
pub mod dedup;
pub mod ordering;

pub use aggregate::AggregateBuilder;
pub use chain::ChainFind;
pub use conditions::check_conditions;
pub use dedup::{DeduplicationStats, QueryDeduplicator, QueryKey};
pub use ordering::standardize_order;
