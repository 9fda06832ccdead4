//! Database configuration module.
//!
//! Handles the connection and creates every table from the entity definitions
//! using `SeaORM`'s `Schema::create_table_from_entity`. Natural-key uniqueness
//! that the ledger and import pipeline rely on is enforced here with unique
//! indexes, so concurrent writers cannot both insert the same key.

use crate::entities::{
    BatchHistory, BatchHistoryDetail, FailedReconciliation, JournalEntry, JournalLine, Purchase,
    PurchaseDetail, ReconciledTransaction, Settlement, journal_entry, purchase_detail,
};
use crate::errors::Result;
use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};

const DEFAULT_DATABASE_URL: &str = "sqlite://data/dropship_ledger.sqlite?mode=rwc";

/// Gets the database URL from the `DATABASE_URL` environment variable or
/// returns the default local `SQLite` path.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection using `DATABASE_URL`, falling back to the default file.
pub async fn create_connection() -> Result<DatabaseConnection> {
    Database::connect(&get_database_url()).await.map_err(Into::into)
}

/// Creates all tables and unique indexes if they do not exist yet.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    // Parents before children so foreign keys resolve.
    create_table(db, &schema, Purchase).await?;
    create_table(db, &schema, PurchaseDetail).await?;
    create_table(db, &schema, Settlement).await?;
    create_table(db, &schema, JournalEntry).await?;
    create_table(db, &schema, JournalLine).await?;
    create_table(db, &schema, ReconciledTransaction).await?;
    create_table(db, &schema, BatchHistory).await?;
    create_table(db, &schema, BatchHistoryDetail).await?;
    create_table(db, &schema, FailedReconciliation).await?;

    for index in unique_indexes() {
        db.execute(builder.build(&index)).await?;
    }

    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let builder = db.get_database_backend();
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(builder.build(&statement)).await?;
    Ok(())
}

fn unique_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("idx_journal_entries_source")
            .table(JournalEntry)
            .col(journal_entry::Column::SourceType)
            .col(journal_entry::Column::SourceId)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_purchase_details_order_sku")
            .table(PurchaseDetail)
            .col(purchase_detail::Column::OrderCode)
            .col(purchase_detail::Column::Sku)
            .unique()
            .if_not_exists()
            .to_owned(),
    ]
}
