/// Batch lifecycle: creation, status transitions, details and grouping
pub mod batch;
/// Failure taxonomy, circuit breaker and the failed-reconciliation trail
pub mod failure;
/// Streaming CSV import of purchases
pub mod import;
/// Journal drafting and idempotent posting
pub mod ledger;
/// Memory pressure sampling and import backpressure
pub mod memory;
/// Injected process counters
pub mod metrics;
/// Scheduler processors for reconcile and import batches
pub mod processors;
/// Purchase lookups and status updates
pub mod purchase;
/// Single and bulk reconciliation
pub mod reconcile;
/// Polling and priority schedulers
pub mod scheduler;
/// Settlement lookups and escrow access
pub mod settlement;
