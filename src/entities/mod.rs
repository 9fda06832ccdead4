//! Entity module - Contains all SeaORM entity definitions for the database.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod batch_history;
pub mod batch_history_detail;
pub mod failed_reconciliation;
pub mod journal_entry;
pub mod journal_line;
pub mod purchase;
pub mod purchase_detail;
pub mod reconciled_transaction;
pub mod settlement;

// Re-export specific types to avoid conflicts
pub use batch_history::{Entity as BatchHistory, Model as BatchHistoryModel};
pub use batch_history_detail::{Entity as BatchHistoryDetail, Model as BatchHistoryDetailModel};
pub use failed_reconciliation::{
    Entity as FailedReconciliation, Model as FailedReconciliationModel,
};
pub use journal_entry::{Entity as JournalEntry, Model as JournalEntryModel};
pub use journal_line::{Entity as JournalLine, Model as JournalLineModel};
pub use purchase::{Entity as Purchase, Model as PurchaseModel};
pub use purchase_detail::{Entity as PurchaseDetail, Model as PurchaseDetailModel};
pub use reconciled_transaction::{
    Entity as ReconciledTransaction, Model as ReconciledTransactionModel,
};
pub use settlement::{Entity as Settlement, Model as SettlementModel};
