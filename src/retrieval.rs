//! Retrieval orchestration
//!
//! A batch starts the inbound receiver, fans C-MOVE requests for the candidate
//! series out over a bounded pool (one association per series), waits a fixed
//! grace period for in-flight pushes and then stops and joins the receiver.

use dimse::types::STUDY_ROOT_MOVE;
use dimse::{AssociationFactory, DimseConfig, MoveQuery, PresentationContext, RemoteNode};
use futures_util::future::join_all;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::archive::compress_subdirectories;
use crate::catalog::{CatalogStore, SeriesRecord};
use crate::config::AppConfig;
use crate::project::Project;
use crate::receiver::InboundReceiver;
use crate::selection::SeriesSelection;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub workers: usize,
    /// Parent of the batch directory `<project>_<YYYYMMDD>`
    pub output_dir: PathBuf,
    /// AE title of the local receiver and C-MOVE destination
    pub local_aet: String,
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Remaining receiver settings (PDU size, timeouts, association limit)
    pub dimse: DimseConfig,
    pub selection: Option<SeriesSelection>,
    pub grace_period: Duration,
    pub ready_timeout: Duration,
    pub compress: bool,
}

impl RetrievalOptions {
    pub fn from_config(config: &AppConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            workers: config.retrieval.workers,
            output_dir: output_dir.into(),
            local_aet: config.dimse.local_aet.clone(),
            bind_addr: config.dimse.bind_addr,
            port: config.dimse.port,
            dimse: config.dimse.clone(),
            selection: None,
            grace_period: config.retrieval.grace_period(),
            ready_timeout: config.retrieval.ready_timeout(),
            compress: config.retrieval.compress,
        }
    }

    /// Settings of the batch receiver; every worker may have a push in flight,
    /// so the association limit is never below the pool size
    pub fn receiver_config(&self) -> DimseConfig {
        let workers = u32::try_from(self.workers).unwrap_or(u32::MAX);
        DimseConfig {
            local_aet: self.local_aet.clone(),
            bind_addr: self.bind_addr,
            port: self.port,
            max_associations: self.dimse.max_associations.max(workers),
            ..self.dimse.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalSummary {
    pub candidates: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Objects the receiver had written when it was stopped
    pub received: usize,
    pub output_root: PathBuf,
    pub archives: Vec<PathBuf>,
}

enum TaskOutcome {
    Completed,
    Failed,
}

/// `<output_dir>/<project>_<YYYYMMDD>`
pub fn batch_directory(output_dir: &Path, project: &str) -> PathBuf {
    let date = chrono::Local::now().format("%Y%m%d");
    output_dir.join(format!("{}_{}", project, date))
}

/// Retrieve the project's catalogued series (or the selected subset)
#[tracing::instrument(skip_all, fields(project = %project.name, workers = options.workers))]
pub async fn retrieve(
    project: &Project,
    catalog: &CatalogStore,
    factory: Arc<dyn AssociationFactory>,
    options: RetrievalOptions,
) -> Result<RetrievalSummary> {
    let candidates = candidate_series(catalog, options.selection.as_ref())?;
    let output_root = batch_directory(&options.output_dir, &project.name);
    let mut summary = RetrievalSummary {
        candidates: candidates.len(),
        output_root: output_root.clone(),
        ..Default::default()
    };
    if candidates.is_empty() {
        warn!("No series to retrieve");
        return Ok(summary);
    }

    let receiver = tokio::time::timeout(
        options.ready_timeout,
        InboundReceiver::start(options.receiver_config(), &output_root),
    )
    .await
    .map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("receiver not ready after {:?}", options.ready_timeout),
        ))
    })??;

    // An unreachable remote fails the whole batch before any task runs
    if let Err(e) = probe(factory.as_ref(), &project.remote).await {
        error!("Cannot associate with {}: {}", project.remote, e);
        receiver.stop().await?;
        return Err(e);
    }

    let total = candidates.len();
    info!(
        "🚚 Retrieving {} series from {} into {} ({} workers)",
        total,
        project.remote,
        output_root.display(),
        options.workers
    );

    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let submitted = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let remote = Arc::new(project.remote.clone());
    let destination: Arc<str> = Arc::from(options.local_aet.as_str());

    let tasks = candidates.into_iter().map(|series| {
        let semaphore = Arc::clone(&semaphore);
        let submitted = Arc::clone(&submitted);
        let done = Arc::clone(&done);
        let factory = Arc::clone(&factory);
        let remote = Arc::clone(&remote);
        let destination = Arc::clone(&destination);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            submitted.fetch_add(1, Ordering::SeqCst);
            let outcome = retrieve_series(factory.as_ref(), &remote, &series, &destination).await;
            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            info!("[{}/{}] {} done", finished, total, series.series_instance_uid);
            outcome
        })
    });

    for joined in join_all(tasks).await {
        match joined {
            Ok(TaskOutcome::Completed) => summary.completed += 1,
            Ok(TaskOutcome::Failed) => summary.failed += 1,
            Err(e) => {
                error!("Retrieval task panicked: {}", e);
                summary.failed += 1;
            }
        }
    }
    summary.submitted = submitted.load(Ordering::SeqCst);

    info!(
        "All {} C-MOVE requests answered, waiting {:?} for in-flight objects",
        summary.submitted, options.grace_period
    );
    tokio::time::sleep(options.grace_period).await;
    summary.received = receiver.stop().await?;

    if options.compress {
        let root = output_root.clone();
        summary.archives = tokio::task::spawn_blocking(move || compress_subdirectories(&root)).await??;
    }

    info!(
        "Retrieval finished: {} completed, {} failed, {} objects received",
        summary.completed, summary.failed, summary.received
    );
    Ok(summary)
}

fn candidate_series(catalog: &CatalogStore, selection: Option<&SeriesSelection>) -> Result<Vec<SeriesRecord>> {
    let all = catalog.series()?;
    let Some(selection) = selection else {
        return Ok(all);
    };
    let candidates: Vec<SeriesRecord> = all
        .into_iter()
        .filter(|series| selection.contains(&series.series_instance_uid))
        .collect();
    if candidates.len() < selection.len() {
        warn!(
            "{} selected series are not in the catalog",
            selection.len() - candidates.len()
        );
    }
    info!("{} of {} selected series found in the catalog", candidates.len(), selection.len());
    Ok(candidates)
}

fn move_contexts() -> Vec<PresentationContext> {
    vec![PresentationContext::uncompressed(STUDY_ROOT_MOVE)]
}

async fn probe(factory: &dyn AssociationFactory, remote: &RemoteNode) -> Result<()> {
    let association = factory.associate(remote, move_contexts()).await?;
    association.release().await?;
    Ok(())
}

async fn retrieve_series(
    factory: &dyn AssociationFactory,
    remote: &RemoteNode,
    series: &SeriesRecord,
    destination: &str,
) -> TaskOutcome {
    let series_uid = &series.series_instance_uid;
    let Some(study_uid) = series.study_instance_uid.as_deref() else {
        warn!("Series {} has no StudyInstanceUID, cannot move it", series_uid);
        return TaskOutcome::Failed;
    };

    let mut association = match factory.associate(remote, move_contexts()).await {
        Ok(association) => association,
        Err(e) => {
            warn!("Association for series {} failed: {}", series_uid, e);
            return TaskOutcome::Failed;
        }
    };

    let query = MoveQuery::series(study_uid, series_uid.as_str(), destination);
    let outcome = match association.move_request(&query).await {
        Ok(moved) if moved.status.is_success() => TaskOutcome::Completed,
        Ok(moved) => {
            warn!(
                "C-MOVE of series {} ended with status {} ({} completed, {} failed)",
                series_uid, moved.status, moved.completed, moved.failed
            );
            TaskOutcome::Failed
        }
        Err(e) => {
            warn!("C-MOVE of series {} failed: {}", series_uid, e);
            TaskOutcome::Failed
        }
    };

    if let Err(e) = association.release().await {
        warn!("Failed to release association for series {}: {}", series_uid, e);
    }
    outcome
}
