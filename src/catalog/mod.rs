//! Persistent series/instance catalog backed by redb
//!
//! redb allows a single write transaction at a time, so all mutations go
//! through one writer thread fed by [`CatalogHandle`]s. Reads open their own
//! read transactions and run concurrently with the writer.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod model;

pub use model::{
    CatalogCounts, FileMetadata, InstanceRecord, Origin, RecordSummary, SeriesKey, SeriesMetadata,
    SeriesRecord, UpsertOutcome,
};

// SeriesInstanceUID -> JSON SeriesRecord
const SERIES: TableDefinition<&str, &str> = TableDefinition::new("series");
// SOPInstanceUID -> JSON InstanceRecord
const INSTANCES: TableDefinition<&str, &str> = TableDefinition::new("instances");
// "<series uid>\0<sop uid>" -> file path
const SERIES_INSTANCES: TableDefinition<&str, &str> = TableDefinition::new("series_instances");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("series {0} is not in the catalog")]
    UnknownSeries(String),

    #[error("catalog writer has stopped")]
    WriterStopped,
}

type CatalogResult<T> = std::result::Result<T, CatalogError>;

enum WriteOp {
    UpsertSeries(SeriesMetadata, oneshot::Sender<CatalogResult<(SeriesKey, UpsertOutcome)>>),
    InsertInstance(SeriesKey, String, PathBuf, oneshot::Sender<CatalogResult<bool>>),
    RecordFiles(Vec<FileMetadata>, oneshot::Sender<CatalogResult<RecordSummary>>),
    Reset(oneshot::Sender<CatalogResult<()>>),
    Shutdown,
}

/// Cloneable write access to a catalog; every worker owns one
#[derive(Clone)]
pub struct CatalogHandle {
    ops: mpsc::UnboundedSender<WriteOp>,
}

impl CatalogHandle {
    async fn request<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<CatalogResult<T>>) -> WriteOp,
    ) -> CatalogResult<T> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(op(tx)).map_err(|_| CatalogError::WriterStopped)?;
        rx.await.map_err(|_| CatalogError::WriterStopped)?
    }

    /// Get-or-create by SeriesInstanceUID; an existing row is never modified
    pub async fn upsert_series(&self, series: SeriesMetadata) -> CatalogResult<(SeriesKey, UpsertOutcome)> {
        self.request(|tx| WriteOp::UpsertSeries(series, tx)).await
    }

    /// Returns false when the SOP instance is already catalogued
    pub async fn insert_instance(
        &self,
        series: &SeriesKey,
        sop_instance_uid: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> CatalogResult<bool> {
        let series = series.clone();
        let sop_instance_uid = sop_instance_uid.into();
        let path = path.into();
        self.request(|tx| WriteOp::InsertInstance(series, sop_instance_uid, path, tx))
            .await
    }

    /// Upsert the series and insert the instance in one transaction
    pub async fn record_file(&self, file: FileMetadata) -> CatalogResult<RecordSummary> {
        self.record_files(vec![file]).await
    }

    /// Record a batch of files in one transaction
    pub async fn record_files(&self, files: Vec<FileMetadata>) -> CatalogResult<RecordSummary> {
        if files.is_empty() {
            return Ok(RecordSummary::default());
        }
        self.request(|tx| WriteOp::RecordFiles(files, tx)).await
    }

    /// Remove every series and instance
    pub async fn reset(&self) -> CatalogResult<()> {
        self.request(WriteOp::Reset).await
    }
}

/// An open catalog file
pub struct CatalogStore {
    db: Arc<Database>,
    path: PathBuf,
    handle: CatalogHandle,
    writer: Option<JoinHandle<()>>,
}

impl CatalogStore {
    /// Open the catalog at `path`, creating it if needed
    pub fn open(path: &Path) -> CatalogResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;

        // Initialize tables
        let txn = db.begin_write()?;
        {
            txn.open_table(SERIES)?;
            txn.open_table(INSTANCES)?;
            txn.open_table(SERIES_INSTANCES)?;
        }
        txn.commit()?;

        let db = Arc::new(db);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let writer_db = Arc::clone(&db);
        let writer = std::thread::Builder::new()
            .name("catalog-writer".to_string())
            .spawn(move || run_writer(writer_db, ops_rx))?;

        tracing::debug!("🗄️  Opened catalog {}", path.display());

        Ok(Self {
            db,
            path: path.to_path_buf(),
            handle: CatalogHandle { ops: ops_tx },
            writer: Some(writer),
        })
    }

    /// Open a catalog that must already exist
    pub fn open_existing(path: &Path) -> crate::Result<Self> {
        if !path.is_file() {
            return Err(crate::Error::CatalogNotFound(path.to_path_buf()));
        }
        Ok(Self::open(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A new write handle
    pub fn handle(&self) -> CatalogHandle {
        self.handle.clone()
    }

    pub async fn upsert_series(&self, series: SeriesMetadata) -> CatalogResult<(SeriesKey, UpsertOutcome)> {
        self.handle.upsert_series(series).await
    }

    pub async fn insert_instance(
        &self,
        series: &SeriesKey,
        sop_instance_uid: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> CatalogResult<bool> {
        self.handle.insert_instance(series, sop_instance_uid, path).await
    }

    pub async fn reset(&self) -> CatalogResult<()> {
        self.handle.reset().await
    }

    /// All series rows, ordered by SeriesInstanceUID
    pub fn series(&self) -> CatalogResult<Vec<SeriesRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SERIES)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            rows.push(serde_json::from_str(value.value())?);
        }
        Ok(rows)
    }

    pub fn series_by_uid(&self, series_instance_uid: &str) -> CatalogResult<Option<SeriesRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SERIES)?;
        match table.get(series_instance_uid)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// Instances of one series, ordered by SOPInstanceUID
    pub fn instances_of(&self, series_instance_uid: &str) -> CatalogResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SERIES_INSTANCES)?;
        let start = format!("{}\u{0}", series_instance_uid);
        let end = format!("{}\u{1}", series_instance_uid);
        let mut rows = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (key, value) = entry?;
            let sop_instance_uid = key.value()[start.len()..].to_string();
            rows.push(InstanceRecord {
                sop_instance_uid,
                series_instance_uid: series_instance_uid.to_string(),
                path: PathBuf::from(value.value()),
            });
        }
        Ok(rows)
    }

    pub fn instance(&self, sop_instance_uid: &str) -> CatalogResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INSTANCES)?;
        match table.get(sop_instance_uid)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn counts(&self) -> CatalogResult<CatalogCounts> {
        let txn = self.db.begin_read()?;
        Ok(CatalogCounts {
            series: txn.open_table(SERIES)?.len()?,
            instances: txn.open_table(INSTANCES)?.len()?,
        })
    }

    /// Stop the writer after it has drained queued writes.
    ///
    /// Handles still alive afterwards get [`CatalogError::WriterStopped`].
    pub fn close(mut self) {
        let _ = self.handle.ops.send(WriteOp::Shutdown);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("Catalog writer for {} panicked", self.path.display());
            }
        }
    }
}

fn run_writer(db: Arc<Database>, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = ops.blocking_recv() {
        match op {
            WriteOp::UpsertSeries(series, reply) => {
                let result = write(&db, |txn| {
                    let outcome = upsert_series_in(txn, &series)?;
                    Ok((SeriesKey(series.series_instance_uid.clone()), outcome))
                });
                let _ = reply.send(result);
            }
            WriteOp::InsertInstance(series, sop_instance_uid, path, reply) => {
                let result = write(&db, |txn| insert_instance_in(txn, &series, &sop_instance_uid, &path));
                let _ = reply.send(result);
            }
            WriteOp::RecordFiles(files, reply) => {
                let result = write(&db, |txn| {
                    let mut summary = RecordSummary::default();
                    for file in &files {
                        if upsert_series_in(txn, &file.series)? == UpsertOutcome::Created {
                            summary.series_created += 1;
                        }
                        let key = SeriesKey(file.series.series_instance_uid.clone());
                        if insert_instance_in(txn, &key, &file.sop_instance_uid, &file.path)? {
                            summary.instances_inserted += 1;
                        }
                    }
                    Ok(summary)
                });
                let _ = reply.send(result);
            }
            WriteOp::Reset(reply) => {
                let result = write(&db, |txn| {
                    txn.delete_table(SERIES)?;
                    txn.delete_table(INSTANCES)?;
                    txn.delete_table(SERIES_INSTANCES)?;
                    txn.open_table(SERIES)?;
                    txn.open_table(INSTANCES)?;
                    txn.open_table(SERIES_INSTANCES)?;
                    Ok(())
                });
                tracing::info!("Catalog reset");
                let _ = reply.send(result);
            }
            WriteOp::Shutdown => break,
        }
    }
    tracing::debug!("Catalog writer stopped");
}

/// Run `f` in a write transaction; an error drops the transaction uncommitted
fn write<T>(db: &Database, f: impl FnOnce(&WriteTransaction) -> CatalogResult<T>) -> CatalogResult<T> {
    let txn = db.begin_write()?;
    let value = f(&txn)?;
    txn.commit()?;
    Ok(value)
}

fn upsert_series_in(txn: &WriteTransaction, series: &SeriesMetadata) -> CatalogResult<UpsertOutcome> {
    let mut table = txn.open_table(SERIES)?;
    let uid = series.series_instance_uid.as_str();
    if table.get(uid)?.is_some() {
        return Ok(UpsertOutcome::Existing);
    }
    let json = serde_json::to_string(series)?;
    table.insert(uid, json.as_str())?;
    Ok(UpsertOutcome::Created)
}

fn insert_instance_in(
    txn: &WriteTransaction,
    series: &SeriesKey,
    sop_instance_uid: &str,
    path: &Path,
) -> CatalogResult<bool> {
    if txn.open_table(SERIES)?.get(series.as_str())?.is_none() {
        return Err(CatalogError::UnknownSeries(series.0.clone()));
    }

    let mut instances = txn.open_table(INSTANCES)?;
    if instances.get(sop_instance_uid)?.is_some() {
        return Ok(false);
    }

    let path_str = path.to_string_lossy();
    let record = InstanceRecord {
        sop_instance_uid: sop_instance_uid.to_string(),
        series_instance_uid: series.0.clone(),
        path: path.to_path_buf(),
    };
    let json = serde_json::to_string(&record)?;
    instances.insert(sop_instance_uid, json.as_str())?;

    let mut by_series = txn.open_table(SERIES_INSTANCES)?;
    let key = format!("{}\u{0}{}", series.0, sop_instance_uid);
    by_series.insert(key.as_str(), path_str.as_ref())?;
    Ok(true)
}
