//! Streaming purchase import.
//!
//! A file is read as CSV in chunks; each chunk is written in one transaction.
//! Malformed rows are skipped and logged as failed batch details, so one bad
//! row never costs its chunk, and a chunk that fails to commit never costs the
//! chunks around it. Existing purchases and detail lines are left untouched,
//! which makes re-importing a file a no-op.
//!
//! File reads run on the blocking pool one chunk at a time, and only the rows
//! of the current chunk are held in memory.

use crate::{
    config::settings::ImportSettings,
    core::{
        batch::{self, BatchStatus, DetailStatus, NewDetail},
        memory::MemoryMonitor,
        metrics::Metrics,
        purchase::{self, NewPurchase},
    },
    entities::batch_history,
    errors::{Error, Result},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinSet, spawn_blocking};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Columns every import file must carry.
pub const REQUIRED_COLUMNS: [&str; 10] = [
    "order_code",
    "invoice_code",
    "store",
    "sku",
    "product_name",
    "quantity",
    "unit_price",
    "shipping_fee",
    "service_fee",
    "total_amount",
];

/// Optional supplier order timestamp column
pub const ORDERED_AT_COLUMN: &str = "ordered_at";

/// Byte stream an import reads from.
pub trait ImportReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> ImportReader for T {}

/// A file to import: its name, its size and a reader positioned anywhere.
pub struct ImportSource {
    /// Display name or path
    pub name: String,
    /// Size in bytes
    pub size: u64,
    reader: Box<dyn ImportReader>,
}

impl ImportSource {
    /// Wraps an arbitrary reader
    pub fn new(name: impl Into<String>, size: u64, reader: impl ImportReader + 'static) -> Self {
        Self {
            name: name.into(),
            size,
            reader: Box::new(reader),
        }
    }

    /// Opens a file on disk
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::new(path.display().to_string(), size, file))
    }
}

impl std::fmt::Debug for ImportSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A validated import row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    /// Line in the file
    pub line: u64,
    /// Purchase fields
    pub purchase: NewPurchase,
    /// Detail SKU
    pub sku: String,
    /// Detail product name
    pub product_name: String,
    /// Detail quantity
    pub quantity: i32,
    /// Detail unit price
    pub unit_price: i64,
    /// `unit_price * quantity`
    pub line_total: i64,
}

/// A row skipped as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// Line in the file
    pub line: u64,
    /// Why the row was skipped
    pub reason: String,
}

/// Progress after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImportProgress {
    /// Rows read so far, including skipped ones
    pub rows_processed: u64,
    /// Time since the file was opened
    pub elapsed: Duration,
    /// Rows per second so far
    pub rows_per_sec: f64,
    /// Estimated time to finish, extrapolated from bytes consumed
    pub eta: Option<Duration>,
}

impl ImportProgress {
    /// Derives throughput and remaining time.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(rows_processed: u64, elapsed: Duration, bytes_read: u64, total_bytes: u64) -> Self {
        let secs = elapsed.as_secs_f64();
        let rows_per_sec = if secs > 0.0 {
            rows_processed as f64 / secs
        } else {
            0.0
        };
        let eta = (rows_per_sec > 0.0 && bytes_read > 0).then(|| {
            let remaining_bytes = total_bytes.saturating_sub(bytes_read) as f64;
            let remaining_rows = rows_processed as f64 * remaining_bytes / bytes_read as f64;
            Duration::from_secs_f64(remaining_rows / rows_per_sec)
        });
        Self {
            rows_processed,
            elapsed,
            rows_per_sec,
            eta,
        }
    }
}

/// Outcome of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// File name
    pub file: String,
    /// Batch tracking the file
    pub batch_id: i64,
    /// Data rows read
    pub rows_read: u64,
    /// Purchases created
    pub purchases_created: u64,
    /// Detail lines created
    pub details_created: u64,
    /// Rows already present
    pub rows_duplicate: u64,
    /// Rows skipped as malformed
    pub rows_failed: Vec<RowFailure>,
    /// Chunks committed
    pub chunks_committed: u64,
    /// Chunks rolled back
    pub chunks_failed: u64,
    /// Purchases whose line items did not add up to the stated total
    pub total_mismatches: Vec<String>,
}

#[derive(Debug, Default)]
struct ChunkResult {
    purchases_created: u64,
    details_created: u64,
    duplicates: u64,
}

type Records = csv::StringRecordsIntoIter<Box<dyn ImportReader>>;

/// Rows read for one chunk, before anything is written.
#[derive(Debug, Default)]
struct RawChunk {
    rows: Vec<ImportRow>,
    failures: Vec<RowFailure>,
    read: u64,
    exhausted: bool,
    bytes_read: u64,
}

#[derive(Debug)]
struct OpenOrder {
    order_code: String,
    expected: i64,
    computed: i64,
}

/// Compares line sums against the stated order total.
///
/// Only the order currently being read is kept; it is checked as soon as a row
/// for another order follows, so lines of one order are expected to be adjacent.
#[derive(Debug, Default)]
struct TotalCheck {
    open: Option<OpenOrder>,
    mismatches: Vec<String>,
}

impl TotalCheck {
    fn observe(&mut self, row: &ImportRow) {
        if let Some(open) = self
            .open
            .as_mut()
            .filter(|o| o.order_code == row.purchase.order_code)
        {
            open.computed = open.computed.saturating_add(row.line_total);
            return;
        }
        self.close();
        self.open = Some(OpenOrder {
            order_code: row.purchase.order_code.clone(),
            expected: row.purchase.total_amount,
            computed: row
                .purchase
                .shipping_fee
                .saturating_add(row.purchase.service_fee)
                .saturating_add(row.line_total),
        });
    }

    // Lenient: a mismatch is reported, never rejected.
    fn close(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        if open.computed != open.expected {
            warn!(
                order_code = %open.order_code,
                expected = open.expected,
                computed = open.computed,
                "Purchase total mismatch"
            );
            self.mismatches.push(open.order_code);
        }
    }
}

/// Streams import files into purchases.
#[derive(Clone)]
pub struct Importer {
    db: DatabaseConnection,
    settings: ImportSettings,
    memory: Arc<MemoryMonitor>,
    metrics: Arc<Metrics>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Importer {
    /// Creates an importer
    #[must_use]
    pub const fn new(
        db: DatabaseConnection,
        settings: ImportSettings,
        memory: Arc<MemoryMonitor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            settings,
            memory,
            metrics,
            shutdown: None,
        }
    }

    /// Stops running imports after their current chunk once `shutdown` turns
    /// true; the batch is then failed as interrupted.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Imports one file under a new batch, finalising the batch status.
    ///
    /// # Errors
    /// `FileTooLarge` (the batch is recorded as failed), header errors, and
    /// fatal read or storage errors.
    pub async fn import(&self, source: ImportSource) -> Result<ImportSummary> {
        let batch = batch::create_import_batch(&self.db, &source.name, source.size).await?;

        if let Err(e) = self.check_size(&source) {
            batch::update_status(&self.db, batch.id, BatchStatus::Failed, Some(&e.to_string())).await?;
            return Err(e);
        }
        batch::claim_batch(&self.db, batch.id).await?;

        match self.import_into_batch(batch.id, source).await {
            Ok(summary) => {
                self.finish_batch(&summary).await?;
                Ok(summary)
            }
            Err(e) => {
                batch::update_status(&self.db, batch.id, BatchStatus::Failed, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Imports the file referenced by a claimed import batch.
    pub async fn import_batch(&self, batch: &batch_history::Model) -> Result<ImportSummary> {
        let path = batch.file_ref.as_deref().ok_or_else(|| Error::Config {
            message: format!("import batch {} has no file reference", batch.id),
        })?;
        let source = ImportSource::from_path(path)?;
        let summary = self.import_into_batch(batch.id, source).await?;
        self.finish_batch(&summary).await?;
        Ok(summary)
    }

    /// Imports files concurrently, at most `max_concurrent_files` at a time.
    ///
    /// Every file runs to completion under its own batch. Returns all summaries,
    /// or the first error once every file has finished.
    pub async fn import_files(&self, sources: Vec<ImportSource>) -> Result<Vec<ImportSummary>> {
        let gate = Arc::new(Semaphore::new(self.settings.max_concurrent_files.max(1)));
        let mut tasks = JoinSet::new();

        for source in sources {
            let importer = self.clone();
            let gate = Arc::clone(&gate);
            tasks.spawn(async move {
                let _permit = gate.acquire_owned().await.map_err(|_| Error::Config {
                    message: "import gate closed".to_string(),
                })?;
                importer.import(source).await
            });
        }

        let mut summaries = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    error!(error = %e, "File import failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "File import task panicked");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }

    fn check_size(&self, source: &ImportSource) -> Result<()> {
        if source.size > self.settings.max_file_size_bytes {
            return Err(Error::FileTooLarge {
                name: source.name.clone(),
                size: source.size,
                limit: self.settings.max_file_size_bytes,
            });
        }
        Ok(())
    }

    /// Runs the chunked import into an existing batch without touching its
    /// status.
    ///
    /// # Errors
    /// `Interrupted` when shutdown is requested before the file is exhausted,
    /// `MemoryPressure` when memory never frees up, header and read errors.
    pub async fn import_into_batch(&self, batch_id: i64, source: ImportSource) -> Result<ImportSummary> {
        self.check_size(&source)?;
        let (mut records, columns) = spawn_blocking(move || open_records(source.reader)).await??;
        let columns = Arc::new(columns);
        info!(file = %source.name, size = source.size, batch_id, "Import started");

        let started = Instant::now();
        let mut summary = ImportSummary {
            file: source.name.clone(),
            batch_id,
            ..Default::default()
        };
        let mut totals = TotalCheck::default();
        let mut chunk_index = 0u64;

        loop {
            self.memory.wait_for_capacity().await?;
            let chunk_size = self.memory.scaled_chunk_size(self.settings.chunk_size);

            let cols = Arc::clone(&columns);
            let (returned, read) = spawn_blocking(move || {
                let chunk = read_chunk(&mut records, &cols, chunk_size);
                (records, chunk)
            })
            .await?;
            records = returned;
            let RawChunk {
                rows,
                failures,
                read,
                exhausted,
                bytes_read,
            } = read?;

            summary.rows_read += read;
            if rows.is_empty() && failures.is_empty() {
                break;
            }
            chunk_index += 1;
            for row in &rows {
                totals.observe(row);
            }

            match self.commit_chunk(&rows).await {
                Ok(result) => {
                    summary.chunks_committed += 1;
                    summary.purchases_created += result.purchases_created;
                    summary.details_created += result.details_created;
                    summary.rows_duplicate += result.duplicates;
                    self.metrics.add_chunks_committed(1);
                    self.metrics.add_rows_imported(result.details_created);
                    self.metrics.add_rows_skipped(result.duplicates);
                }
                Err(e) => {
                    summary.chunks_failed += 1;
                    self.metrics.add_chunks_failed(1);
                    warn!(batch_id, chunk = chunk_index, rows = rows.len(), error = %e, "Chunk rolled back");
                    batch::record_detail(
                        &self.db,
                        batch_id,
                        NewDetail {
                            reference: format!("chunk:{chunk_index}"),
                            related_reference: None,
                        },
                        DetailStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                }
            }

            for failure in failures {
                warn!(batch_id, line = failure.line, reason = %failure.reason, "Row skipped");
                batch::record_detail(
                    &self.db,
                    batch_id,
                    NewDetail {
                        reference: format!("row:{}", failure.line),
                        related_reference: None,
                    },
                    DetailStatus::Failed,
                    Some(failure.reason.clone()),
                )
                .await?;
                self.metrics.add_rows_skipped(1);
                summary.rows_failed.push(failure);
            }

            batch::update_done(&self.db, batch_id, i64::try_from(read).unwrap_or(i64::MAX)).await?;
            let progress = ImportProgress::estimate(summary.rows_read, started.elapsed(), bytes_read, source.size);
            info!(
                batch_id,
                chunk = chunk_index,
                chunk_size,
                rows = progress.rows_processed,
                elapsed_ms = progress.elapsed.as_millis(),
                rows_per_sec = progress.rows_per_sec,
                eta_secs = progress.eta.map(|d| d.as_secs()),
                "Import progress"
            );

            if exhausted {
                break;
            }
            if self.stop_requested() {
                warn!(batch_id, chunk = chunk_index, rows = summary.rows_read, "Import interrupted by shutdown");
                return Err(Error::Interrupted {
                    batch_id,
                    chunk: chunk_index,
                });
            }
        }

        totals.close();
        summary.total_mismatches = totals.mismatches;
        summary.total_mismatches.sort();

        batch::set_total_items(&self.db, batch_id, i64::try_from(summary.rows_read).unwrap_or(i64::MAX))
            .await?;
        info!(
            file = %summary.file,
            rows = summary.rows_read,
            purchases = summary.purchases_created,
            details = summary.details_created,
            duplicates = summary.rows_duplicate,
            failed_rows = summary.rows_failed.len(),
            failed_chunks = summary.chunks_failed,
            elapsed_ms = started.elapsed().as_millis(),
            "Import finished"
        );
        Ok(summary)
    }

    async fn commit_chunk(&self, rows: &[ImportRow]) -> Result<ChunkResult> {
        let mut result = ChunkResult::default();
        if rows.is_empty() {
            return Ok(result);
        }

        let txn = self.db.begin().await?;
        for row in rows {
            let order_code = &row.purchase.order_code;
            if !purchase::purchase_exists(&txn, order_code).await? {
                purchase::create_purchase(&txn, row.purchase.clone()).await?;
                result.purchases_created += 1;
            }
            if purchase::detail_exists(&txn, order_code, &row.sku).await? {
                debug!(order_code, sku = %row.sku, "Detail already imported");
                result.duplicates += 1;
                continue;
            }
            purchase::create_detail(
                &txn,
                order_code,
                &row.sku,
                &row.product_name,
                row.quantity,
                row.unit_price,
            )
            .await?;
            result.details_created += 1;
        }
        txn.commit().await?;
        Ok(result)
    }

    async fn finish_batch(&self, summary: &ImportSummary) -> Result<()> {
        if summary.chunks_failed > 0 {
            let message = format!(
                "{} of {} chunks failed",
                summary.chunks_failed,
                summary.chunks_failed + summary.chunks_committed
            );
            batch::update_status(&self.db, summary.batch_id, BatchStatus::Failed, Some(&message)).await?;
            self.metrics.add_batches_failed(1);
        } else {
            let message = (!summary.rows_failed.is_empty())
                .then(|| format!("{} malformed rows skipped", summary.rows_failed.len()));
            batch::update_status(
                &self.db,
                summary.batch_id,
                BatchStatus::Completed,
                message.as_deref(),
            )
            .await?;
            self.metrics.add_batches_completed(1);
        }
        Ok(())
    }
}

/// Rewinds the reader and validates the header.
fn open_records(mut reader: Box<dyn ImportReader>) -> Result<(Records, HashMap<String, usize>)> {
    reader.seek(SeekFrom::Start(0))?;
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);
    let columns = header_columns(reader.headers()?)?;
    Ok((reader.into_records(), columns))
}

/// Reads up to `chunk_size` rows, parsing each one.
fn read_chunk(records: &mut Records, columns: &HashMap<String, usize>, chunk_size: usize) -> Result<RawChunk> {
    let mut chunk = RawChunk {
        rows: Vec::with_capacity(chunk_size),
        exhausted: true,
        ..Default::default()
    };
    for next in records.by_ref() {
        chunk.read += 1;
        match next {
            Ok(record) => match parse_row(&record, columns) {
                Ok(row) => chunk.rows.push(row),
                Err(failure) => chunk.failures.push(failure),
            },
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => chunk.failures.push(RowFailure {
                line: e.position().map_or(0, csv::Position::line),
                reason: e.to_string(),
            }),
        }
        if chunk.rows.len() + chunk.failures.len() >= chunk_size {
            chunk.exhausted = false;
            break;
        }
    }
    chunk.bytes_read = records.reader().position().byte();
    Ok(chunk)
}

/// Maps column names to positions, rejecting headers that lack a required column.
fn header_columns(header: &StringRecord) -> Result<HashMap<String, usize>> {
    let columns: HashMap<String, usize> = header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !columns.contains_key(**c))
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() {
        Ok(columns)
    } else {
        Err(Error::InvalidHeader { missing })
    }
}

fn parse_row(record: &StringRecord, columns: &HashMap<String, usize>) -> std::result::Result<ImportRow, RowFailure> {
    let line = record.position().map_or(0, csv::Position::line);
    let fail = |reason: String| RowFailure { line, reason };
    let field = |name: &str| {
        columns
            .get(name)
            .and_then(|i| record.get(*i))
            .unwrap_or("")
    };
    let required = |name: &str| {
        let value = field(name);
        if value.is_empty() {
            Err(fail(format!("{name} is empty")))
        } else {
            Ok(value.to_string())
        }
    };
    let amount = |name: &str| parse_amount(field(name)).map_err(|e| fail(format!("{name}: {e}")));

    let quantity: i32 = field("quantity")
        .parse()
        .map_err(|e| fail(format!("quantity: {e}")))?;
    if quantity <= 0 {
        return Err(fail(format!("quantity must be positive, got {quantity}")));
    }
    let ordered_at = match columns.get(ORDERED_AT_COLUMN).and_then(|i| record.get(*i)) {
        None | Some("") => None,
        Some(raw) => Some(parse_timestamp(raw).map_err(|e| fail(format!("{ORDERED_AT_COLUMN}: {e}")))?),
    };

    let unit_price = amount("unit_price")?;
    let line_total = unit_price
        .checked_mul(i64::from(quantity))
        .ok_or_else(|| fail(format!("line total overflows: {quantity} x {unit_price}")))?;
    let shipping_fee = amount("shipping_fee")?;
    let service_fee = amount("service_fee")?;
    shipping_fee
        .checked_add(service_fee)
        .and_then(|fees| fees.checked_add(line_total))
        .ok_or_else(|| fail("fees and line total overflow".to_string()))?;

    Ok(ImportRow {
        line,
        purchase: NewPurchase {
            order_code: required("order_code")?,
            invoice_code: required("invoice_code")?,
            store: required("store")?,
            total_amount: amount("total_amount")?,
            shipping_fee,
            service_fee,
            ordered_at,
        },
        sku: required("sku")?,
        product_name: field("product_name").to_string(),
        quantity,
        unit_price,
        line_total,
    })
}

/// Parses a non-negative decimal amount into minor units, rounding half away
/// from zero at two decimal places.
pub fn parse_amount(raw: &str) -> std::result::Result<i64, String> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return Err("empty amount".to_string());
    }
    let value = Decimal::from_str(&cleaned).map_err(|e| format!("invalid amount {raw:?}: {e}"))?;
    if value.is_sign_negative() {
        return Err(format!("negative amount {raw:?}"));
    }
    let minor = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero) * Decimal::ONE_HUNDRED;
    minor
        .to_i64()
        .ok_or_else(|| format!("amount {raw:?} out of range"))
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
        .map_err(|e| format!("unrecognised timestamp {raw:?}: {e}"))
}
