//! Ledger posting - Turns purchases and settlements into balanced journals.
//!
//! Every journal is built as a [`JournalDraft`] first and validated (at least two
//! lines, no negative amounts, debits equal credits) before anything is written.
//! The entry, its lines and any follow-up rows are written in one database
//! transaction, so readers never observe a partial journal.
//!
//! At most one entry exists per `(source_type, source_id)`. The check before the
//! insert handles the common case; the unique index on those columns handles two
//! writers racing for the same key, and the loser reports the winner's entry.

use crate::{
    config::settings::AccountMap,
    core::{metrics::Metrics, purchase::PurchaseStatus},
    entities::{
        JournalEntry, JournalLine, journal_entry, journal_line, purchase, reconciled_transaction,
        settlement,
    },
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Source types used as the first half of a journal's natural key.
pub mod source_type {
    /// Sale settlement matched to a purchase
    pub const RECONCILE: &str = "reconcile";
    /// Return or cancellation of a purchase
    pub const RETURN: &str = "return";
    /// Manual balance adjustment
    pub const ADJUSTMENT: &str = "adjustment";
    /// Ads wallet top-up
    pub const TOPUP: &str = "topup";
    /// Advertising spend
    pub const ADS_COST: &str = "ads_cost";
    /// Withdrawal to bank
    pub const WITHDRAWAL: &str = "withdrawal";
}

/// Reconciled-transaction status for a successful pairing
pub const MATCHED: &str = "matched";
/// Reconciled-transaction status for an explicitly unmatched pairing
pub const UNMATCHED: &str = "unmatched";

/// One line of a journal before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDraft {
    /// Chart-of-accounts code
    pub account_code: String,
    /// Debit when true
    pub is_debit: bool,
    /// Non-negative amount
    pub amount: i64,
    /// Optional memo
    pub memo: Option<String>,
}

/// A journal entry with its lines, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalDraft {
    /// Natural key, first half
    pub source_type: String,
    /// Natural key, second half
    pub source_id: String,
    /// Store attribution
    pub store: String,
    /// Description
    pub description: String,
    /// Accounting date
    pub entry_date: DateTimeUtc,
    /// Lines
    pub lines: Vec<LineDraft>,
}

impl JournalDraft {
    /// Starts an empty draft dated now.
    #[must_use]
    pub fn new(source_type: &str, source_id: &str, store: &str, description: String) -> Self {
        Self {
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            store: store.to_string(),
            description,
            entry_date: Utc::now(),
            lines: Vec::new(),
        }
    }

    /// Adds a balanced debit/credit pair. Zero amounts add nothing; negative
    /// amounts swap the sides.
    pub fn push_pair(&mut self, debit: &str, credit: &str, amount: i64, memo: &str) {
        if amount == 0 {
            return;
        }
        let (debit, credit) = if amount > 0 { (debit, credit) } else { (credit, debit) };
        let amount = amount.abs();
        self.lines.push(LineDraft {
            account_code: debit.to_string(),
            is_debit: true,
            amount,
            memo: Some(memo.to_string()),
        });
        self.lines.push(LineDraft {
            account_code: credit.to_string(),
            is_debit: false,
            amount,
            memo: Some(memo.to_string()),
        });
    }

    /// Sum of debit lines and sum of credit lines.
    #[must_use]
    pub fn totals(&self) -> (i64, i64) {
        self.lines.iter().fold((0, 0), |(dr, cr), line| {
            if line.is_debit {
                (dr + line.amount, cr)
            } else {
                (dr, cr + line.amount)
            }
        })
    }

    /// Checks the draft can be persisted.
    ///
    /// # Errors
    /// `JournalCreation` for too few lines or negative amounts,
    /// `UnbalancedJournal` when debits differ from credits.
    pub fn validate(&self) -> Result<()> {
        if self.lines.len() < 2 {
            return Err(Error::JournalCreation {
                message: format!(
                    "{}:{} needs at least two non-zero lines, got {}",
                    self.source_type,
                    self.source_id,
                    self.lines.len()
                ),
            });
        }
        if let Some(line) = self.lines.iter().find(|l| l.amount < 0) {
            return Err(Error::JournalCreation {
                message: format!("negative amount {} on account {}", line.amount, line.account_code),
            });
        }
        let (debit, credit) = self.totals();
        if debit != credit {
            return Err(Error::UnbalancedJournal { debit, credit });
        }
        Ok(())
    }
}

/// Result of a post attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// A new entry was written
    Posted {
        /// New entry id
        journal_id: i64,
    },
    /// An entry for the same source key already existed; nothing was written
    AlreadyPosted {
        /// Existing entry id
        journal_id: i64,
    },
}

impl PostOutcome {
    /// Id of the entry for the source key
    #[must_use]
    pub const fn journal_id(self) -> i64 {
        match self {
            Self::Posted { journal_id } | Self::AlreadyPosted { journal_id } => journal_id,
        }
    }

    /// True when this call wrote the entry
    #[must_use]
    pub const fn is_new(self) -> bool {
        matches!(self, Self::Posted { .. })
    }
}

/// Kinds of single-source, two-line journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoLineKind {
    /// Signed correction to the clearing balance
    Adjustment,
    /// Clearing balance moved into the ads wallet
    Topup,
    /// Ads wallet spent on advertising
    AdsCost,
    /// Clearing balance paid out to the bank
    Withdrawal,
}

impl TwoLineKind {
    /// Source type of the journal
    #[must_use]
    pub const fn source_type(self) -> &'static str {
        match self {
            Self::Adjustment => source_type::ADJUSTMENT,
            Self::Topup => source_type::TOPUP,
            Self::AdsCost => source_type::ADS_COST,
            Self::Withdrawal => source_type::WITHDRAWAL,
        }
    }

    fn accounts(self, accounts: &AccountMap) -> (&str, &str) {
        match self {
            Self::Adjustment => (&accounts.clearing, &accounts.adjustment),
            Self::Topup => (&accounts.wallet, &accounts.clearing),
            Self::AdsCost => (&accounts.advertising, &accounts.wallet),
            Self::Withdrawal => (&accounts.bank, &accounts.clearing),
        }
    }
}

/// Input for [`LedgerPoster::post_two_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoLineJournal {
    /// Journal kind
    pub kind: TwoLineKind,
    /// External id of the wallet transaction
    pub source_id: String,
    /// Store
    pub store: String,
    /// Amount. Signed for adjustments; other kinds use the magnitude.
    pub amount: i64,
    /// Optional description override
    pub description: Option<String>,
}

/// How much of an order came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Whole order cancelled or returned
    Full,
    /// Part of the order refunded
    Partial {
        /// Refunded to the buyer by the marketplace
        buyer_refund: i64,
        /// Refunded to us by the supplier
        supplier_refund: i64,
    },
}

#[derive(Debug, Default)]
struct AfterPost {
    reconciled: Option<(String, String)>,
    purchase_status: Option<(String, PurchaseStatus)>,
}

/// Builds and writes journals using the configured accounts.
#[derive(Debug, Clone)]
pub struct LedgerPoster {
    accounts: AccountMap,
    metrics: Arc<Metrics>,
}

impl LedgerPoster {
    /// Creates a poster writing to `accounts`
    #[must_use]
    pub const fn new(accounts: AccountMap, metrics: Arc<Metrics>) -> Self {
        Self { accounts, metrics }
    }

    /// Configured account map
    #[must_use]
    pub const fn accounts(&self) -> &AccountMap {
        &self.accounts
    }

    /// Builds the sale journal for a matched pair.
    ///
    /// Cost of goods is recognised against pending purchases for the purchase
    /// total, and the clearing balance against revenue for the settlement's net
    /// income. The two figures come from different systems and are not expected
    /// to match; each pair balances on its own.
    pub fn sale_draft(
        &self,
        purchase: &purchase::Model,
        settlement: &settlement::Model,
        store: &str,
    ) -> Result<JournalDraft> {
        if purchase.total_amount < 0 {
            return Err(Error::JournalCreation {
                message: format!(
                    "purchase {} has negative total {}",
                    purchase.order_code, purchase.total_amount
                ),
            });
        }
        let a = &self.accounts;
        let mut draft = JournalDraft::new(
            source_type::RECONCILE,
            &settlement.order_code,
            store,
            format!(
                "Settlement {} for purchase {}",
                settlement.order_code, purchase.order_code
            ),
        );
        draft.push_pair(
            &a.cost_of_goods,
            &a.pending_purchases,
            purchase.total_amount,
            "cost of goods sold",
        );
        if settlement.net_income >= 0 {
            draft.push_pair(&a.clearing, &a.sales_revenue, settlement.net_income, "settlement income");
        } else {
            draft.push_pair(
                &a.marketplace_fees,
                &a.clearing,
                -settlement.net_income,
                "settlement shortfall",
            );
        }
        Ok(draft)
    }

    /// Posts the sale journal for a matched pair and appends a `matched`
    /// reconciled-transaction row. Idempotent per settlement.
    pub async fn post(
        &self,
        db: &DatabaseConnection,
        purchase: &purchase::Model,
        settlement: &settlement::Model,
        store: &str,
    ) -> Result<PostOutcome> {
        let draft = self.sale_draft(purchase, settlement, store)?;
        let after = AfterPost {
            reconciled: Some((purchase.order_code.clone(), settlement.order_code.clone())),
            purchase_status: None,
        };
        self.commit_draft(db, &draft, after).await
    }

    /// Builds a two-line journal.
    pub fn two_line_draft(&self, input: &TwoLineJournal) -> Result<JournalDraft> {
        if input.amount == 0 {
            return Err(Error::JournalCreation {
                message: format!("{}:{} has zero amount", input.kind.source_type(), input.source_id),
            });
        }
        let amount = match input.kind {
            TwoLineKind::Adjustment => input.amount,
            _ => input.amount.abs(),
        };
        let (debit, credit) = input.kind.accounts(&self.accounts);
        let description = input.description.clone().unwrap_or_else(|| {
            format!("{} {}", input.kind.source_type(), input.source_id)
        });
        let mut draft = JournalDraft::new(
            input.kind.source_type(),
            &input.source_id,
            &input.store,
            description,
        );
        draft.push_pair(debit, credit, amount, input.kind.source_type());
        Ok(draft)
    }

    /// Posts an adjustment, top-up, ads-cost or withdrawal journal.
    pub async fn post_two_line(
        &self,
        db: &DatabaseConnection,
        input: &TwoLineJournal,
    ) -> Result<PostOutcome> {
        let draft = self.two_line_draft(input)?;
        self.commit_draft(db, &draft, AfterPost::default()).await
    }

    /// Builds the journal for a return or cancellation and the purchase status it
    /// leads to.
    ///
    /// A full return reverses the purchase into a supplier refund receivable and
    /// books whatever the marketplace still settled (2-4 lines). A partial return
    /// books gross revenue, the buyer refund, the cost of goods kept and the
    /// supplier refund (4-8 lines).
    pub fn return_draft(
        &self,
        purchase: &purchase::Model,
        settlement: Option<&settlement::Model>,
        kind: ReturnKind,
        store: &str,
    ) -> Result<(JournalDraft, PurchaseStatus)> {
        let a = &self.accounts;
        let cost = purchase.total_amount;
        let net = settlement.map_or(0, |s| s.net_income);
        let mut draft = JournalDraft::new(
            source_type::RETURN,
            &purchase.order_code,
            store,
            String::new(),
        );

        let status = match kind {
            ReturnKind::Full => {
                draft.description = format!("Full return of purchase {}", purchase.order_code);
                draft.push_pair(
                    &a.supplier_refund_receivable,
                    &a.pending_purchases,
                    cost,
                    "supplier refund due",
                );
                if net > 0 {
                    draft.push_pair(&a.clearing, &a.sales_revenue, net, "settled despite return");
                } else {
                    draft.push_pair(&a.marketplace_fees, &a.clearing, -net, "return charges");
                }
                if settlement.is_some() {
                    PurchaseStatus::Returned
                } else {
                    PurchaseStatus::Cancelled
                }
            }
            ReturnKind::Partial {
                buyer_refund,
                supplier_refund,
            } => {
                if buyer_refund < 0 || supplier_refund < 0 || supplier_refund > cost {
                    return Err(Error::JournalCreation {
                        message: format!(
                            "invalid partial return for {}: buyer refund {buyer_refund}, supplier refund {supplier_refund}, cost {cost}",
                            purchase.order_code
                        ),
                    });
                }
                draft.description = format!("Partial return of purchase {}", purchase.order_code);
                draft.push_pair(&a.clearing, &a.sales_revenue, net + buyer_refund, "gross settlement");
                draft.push_pair(&a.sales_returns, &a.clearing, buyer_refund, "buyer refund");
                draft.push_pair(
                    &a.cost_of_goods,
                    &a.pending_purchases,
                    cost - supplier_refund,
                    "cost of goods kept",
                );
                draft.push_pair(
                    &a.supplier_refund_receivable,
                    &a.pending_purchases,
                    supplier_refund,
                    "supplier refund due",
                );
                PurchaseStatus::PartiallyReturned
            }
        };
        Ok((draft, status))
    }

    /// Posts a return/cancellation journal and moves the purchase and its detail
    /// lines to the resulting terminal status. Idempotent per purchase.
    pub async fn post_return(
        &self,
        db: &DatabaseConnection,
        purchase: &purchase::Model,
        settlement: Option<&settlement::Model>,
        kind: ReturnKind,
        store: &str,
    ) -> Result<PostOutcome> {
        let (draft, status) = self.return_draft(purchase, settlement, kind, store)?;
        let after = AfterPost {
            reconciled: settlement.map(|s| (purchase.order_code.clone(), s.order_code.clone())),
            purchase_status: Some((purchase.order_code.clone(), status)),
        };
        self.commit_draft(db, &draft, after).await
    }

    /// Replaces whatever journal exists for the draft's source key with the
    /// draft, in one transaction. Returns the new entry id.
    pub async fn replace_journal(&self, db: &DatabaseConnection, draft: &JournalDraft) -> Result<i64> {
        draft.validate()?;
        let txn = db.begin().await?;
        if let Some(existing) = find_journal_by_source(&txn, &draft.source_type, &draft.source_id).await? {
            delete_journal(&txn, existing.id).await?;
            debug!(journal_id = existing.id, "Deleted journal for replacement");
        }
        let journal_id = insert_draft(&txn, draft).await?;
        txn.commit().await?;
        self.metrics.add_journals_posted(1);
        info!(journal_id, source_type = %draft.source_type, source_id = %draft.source_id, "Journal replaced");
        Ok(journal_id)
    }

    async fn commit_draft(
        &self,
        db: &DatabaseConnection,
        draft: &JournalDraft,
        after: AfterPost,
    ) -> Result<PostOutcome> {
        draft.validate()?;

        let txn = db.begin().await?;
        if let Some(existing) = find_journal_by_source(&txn, &draft.source_type, &draft.source_id).await? {
            debug!(journal_id = existing.id, source_id = %draft.source_id, "Journal already posted");
            self.metrics.add_journals_duplicate(1);
            return Ok(PostOutcome::AlreadyPosted {
                journal_id: existing.id,
            });
        }

        let journal_id = match insert_draft(&txn, draft).await {
            Ok(id) => id,
            Err(e) if e.is_unique_violation() => {
                // Lost the race; the transaction rolls back on drop.
                drop(txn);
                return self.resolve_duplicate(db, draft).await;
            }
            Err(e) => return Err(e),
        };

        if let Some((purchase_ref, settlement_ref)) = after.reconciled {
            record_reconciliation(&txn, &purchase_ref, Some(&settlement_ref), MATCHED).await?;
        }
        if let Some((order_code, status)) = after.purchase_status {
            crate::core::purchase::update_purchase_status(&txn, &order_code, status).await?;
            crate::core::purchase::update_detail_statuses(&txn, &order_code, status).await?;
        }

        txn.commit().await?;
        self.metrics.add_journals_posted(1);
        info!(
            journal_id,
            source_type = %draft.source_type,
            source_id = %draft.source_id,
            lines = draft.lines.len(),
            "Journal posted"
        );
        Ok(PostOutcome::Posted { journal_id })
    }

    async fn resolve_duplicate(
        &self,
        db: &DatabaseConnection,
        draft: &JournalDraft,
    ) -> Result<PostOutcome> {
        let existing = find_journal_by_source(db, &draft.source_type, &draft.source_id)
            .await?
            .ok_or_else(|| Error::JournalCreation {
                message: format!(
                    "unique violation for {}:{} but no entry found",
                    draft.source_type, draft.source_id
                ),
            })?;
        self.metrics.add_journals_duplicate(1);
        Ok(PostOutcome::AlreadyPosted {
            journal_id: existing.id,
        })
    }
}

async fn insert_draft<C>(db: &C, draft: &JournalDraft) -> Result<i64>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let entry = journal_entry::ActiveModel {
        entry_date: Set(draft.entry_date),
        description: Set(draft.description.clone()),
        source_type: Set(draft.source_type.clone()),
        source_id: Set(draft.source_id.clone()),
        store: Set(draft.store.clone()),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let lines = draft.lines.iter().map(|line| journal_line::ActiveModel {
        journal_id: Set(entry.id),
        account_code: Set(line.account_code.clone()),
        is_debit: Set(line.is_debit),
        amount: Set(line.amount),
        memo: Set(line.memo.clone()),
        ..Default::default()
    });
    JournalLine::insert_many(lines).exec(db).await?;

    Ok(entry.id)
}

/// Finds the entry for a source key.
pub async fn find_journal_by_source<C>(
    db: &C,
    source_type: &str,
    source_id: &str,
) -> Result<Option<journal_entry::Model>>
where
    C: ConnectionTrait,
{
    JournalEntry::find()
        .filter(journal_entry::Column::SourceType.eq(source_type))
        .filter(journal_entry::Column::SourceId.eq(source_id))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Returns the subset of `source_ids` that have an entry of `source_type`.
pub async fn posted_source_ids<C>(
    db: &C,
    source_type: &str,
    source_ids: &[String],
) -> Result<HashSet<String>>
where
    C: ConnectionTrait,
{
    let mut posted = HashSet::new();
    for slice in source_ids.chunks(crate::core::purchase::BULK_LOOKUP_SLICE) {
        let entries = JournalEntry::find()
            .filter(journal_entry::Column::SourceType.eq(source_type))
            .filter(journal_entry::Column::SourceId.is_in(slice.iter().cloned()))
            .all(db)
            .await?;
        posted.extend(entries.into_iter().map(|e| e.source_id));
    }
    Ok(posted)
}

/// Lines of an entry, debits first.
pub async fn journal_lines<C>(db: &C, journal_id: i64) -> Result<Vec<journal_line::Model>>
where
    C: ConnectionTrait,
{
    JournalLine::find()
        .filter(journal_line::Column::JournalId.eq(journal_id))
        .order_by_desc(journal_line::Column::IsDebit)
        .order_by_asc(journal_line::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Deletes an entry and its lines.
pub async fn delete_journal<C>(db: &C, journal_id: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    JournalLine::delete_many()
        .filter(journal_line::Column::JournalId.eq(journal_id))
        .exec(db)
        .await?;
    JournalEntry::delete_by_id(journal_id).exec(db).await?;
    Ok(())
}

/// Appends a reconciled-transaction row.
pub async fn record_reconciliation<C>(
    db: &C,
    purchase_ref: &str,
    settlement_ref: Option<&str>,
    status: &str,
) -> Result<reconciled_transaction::Model>
where
    C: ConnectionTrait,
{
    reconciled_transaction::ActiveModel {
        purchase_ref: Set(purchase_ref.to_string()),
        settlement_ref: Set(settlement_ref.map(str::to_string)),
        status: Set(status.to_string()),
        matched_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}
