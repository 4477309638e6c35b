//! Transmission of catalogued series to a remote node over C-STORE

use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use dimse::{AssociationFactory, PresentationContext, RemoteNode};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, InstanceRecord};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Final status was success
    Stored(u16),
    /// The remote answered with a non-success status
    Failed(u16),
    /// The file could not be sent
    Error(String),
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOutcome::Stored(code) => write!(f, "stored (0x{:04X})", code),
            FileOutcome::Failed(code) => write!(f, "failed (0x{:04X})", code),
            FileOutcome::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub series_instance_uid: String,
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct TransmissionReport {
    pub files: Vec<FileStatus>,
    /// Requested series that are not in the catalog
    pub skipped_series: Vec<String>,
}

impl TransmissionReport {
    pub fn stored(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Stored(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.stored()
    }
}

/// SOP classes and transfer syntaxes found by sampling the selected series
type Capabilities = BTreeMap<String, BTreeSet<String>>;

/// Send every instance of `series_uids` to `remote`, in series order
#[tracing::instrument(skip_all, fields(remote = %remote, series = series_uids.len()))]
pub async fn send(
    catalog: &CatalogStore,
    series_uids: &[String],
    remote: &RemoteNode,
    factory: &dyn AssociationFactory,
) -> Result<TransmissionReport> {
    let mut report = TransmissionReport::default();
    let mut plan: Vec<(String, Vec<InstanceRecord>)> = Vec::new();
    for uid in series_uids {
        if catalog.series_by_uid(uid)?.is_none() {
            warn!("Series {} is not in the catalog, skipping", uid);
            report.skipped_series.push(uid.clone());
            continue;
        }
        let instances = catalog.instances_of(uid)?;
        if instances.is_empty() {
            warn!("Series {} has no local instances", uid);
        }
        plan.push((uid.clone(), instances));
    }

    let samples: Vec<PathBuf> = plan
        .iter()
        .filter_map(|(_, instances)| instances.first().map(|i| i.path.clone()))
        .collect();
    let capabilities = tokio::task::spawn_blocking(move || sample_capabilities(&samples)).await?;
    if capabilities.is_empty() {
        return Err(Error::NoPresentationContext(
            "no readable DICOM file among the selected series".to_string(),
        ));
    }

    let contexts: Vec<PresentationContext> = capabilities
        .into_iter()
        .map(|(sop_class, syntaxes)| PresentationContext::with_preferred(sop_class, syntaxes))
        .collect();
    debug!("Proposing {} presentation contexts", contexts.len());

    let mut association = factory.associate(remote, contexts).await?;
    let total: usize = plan.iter().map(|(_, instances)| instances.len()).sum();
    info!("📤 Sending {} files from {} series to {}", total, plan.len(), remote);

    let mut sent = 0;
    for (series_uid, instances) in plan {
        for instance in instances {
            sent += 1;
            let outcome = match association.store_file(&instance.path).await {
                Ok(status) if status.is_success() => FileOutcome::Stored(status.code()),
                Ok(status) => {
                    warn!("{} was not stored: status {}", instance.path.display(), status);
                    FileOutcome::Failed(status.code())
                }
                Err(e) => {
                    warn!("{} could not be sent: {}", instance.path.display(), e);
                    FileOutcome::Error(e.to_string())
                }
            };
            debug!("[{}/{}] {}: {}", sent, total, instance.path.display(), outcome);
            report.files.push(FileStatus {
                series_instance_uid: series_uid.clone(),
                path: instance.path,
                outcome,
            });
        }
    }

    if let Err(e) = association.release().await {
        warn!("Failed to release association with {}: {}", remote, e);
    }

    info!(
        "Transmission finished: {} stored, {} failed",
        report.stored(),
        report.failed()
    );
    Ok(report)
}

fn sample_capabilities(samples: &[PathBuf]) -> Capabilities {
    let mut capabilities = Capabilities::new();
    for path in samples {
        match read_capability(path) {
            Ok((sop_class, transfer_syntax)) => {
                let syntaxes = capabilities.entry(sop_class).or_default();
                if !transfer_syntax.is_empty() {
                    syntaxes.insert(transfer_syntax);
                }
            }
            Err(e) => warn!("Cannot sample {}: {}", path.display(), e),
        }
    }
    capabilities
}

fn read_capability(path: &Path) -> std::result::Result<(String, String), String> {
    let file = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| e.to_string())?;
    let meta = file.meta();
    let sop_class = meta.media_storage_sop_class_uid.trim_end_matches('\0').to_string();
    let transfer_syntax = meta.transfer_syntax.trim_end_matches('\0').to_string();
    if sop_class.is_empty() {
        return Err("no media storage SOP class".to_string());
    }
    Ok((sop_class, transfer_syntax))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_samples_yield_no_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-dicom.txt");
        std::fs::write(&path, b"plain text").unwrap();
        assert!(sample_capabilities(&[path]).is_empty());
    }

    #[test]
    fn test_report_counts() {
        let status = |outcome| FileStatus {
            series_instance_uid: "1.2".to_string(),
            path: PathBuf::from("/a.dcm"),
            outcome,
        };
        let report = TransmissionReport {
            files: vec![
                status(FileOutcome::Stored(0)),
                status(FileOutcome::Failed(0xA700)),
                status(FileOutcome::Error("closed".to_string())),
            ],
            skipped_series: Vec::new(),
        };
        assert_eq!(report.stored(), 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(FileOutcome::Failed(0xA700).to_string(), "failed (0xA700)");
    }
}
