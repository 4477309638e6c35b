//! Local archive scanner
//!
//! Files are grouped by directory; each directory is parsed on the blocking
//! pool and written to the catalog as a single batch. At most `workers`
//! directories are in flight at once.

use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use dimse::types::string_value;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{CatalogStore, FileMetadata, Origin, SeriesMetadata};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub workers: usize,
    /// Keep existing catalog content instead of resetting it first
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub directories: usize,
    pub files_seen: usize,
    pub indexed: usize,
    pub skipped_missing_uid: usize,
    pub skipped_not_dicom: usize,
    pub failed_read: usize,
    pub series_created: usize,
    pub instances_inserted: usize,
}

impl ScanReport {
    fn merge(&mut self, other: &ScanReport) {
        self.directories += other.directories;
        self.files_seen += other.files_seen;
        self.indexed += other.indexed;
        self.skipped_missing_uid += other.skipped_missing_uid;
        self.skipped_not_dicom += other.skipped_not_dicom;
        self.failed_read += other.failed_read;
        self.series_created += other.series_created;
        self.instances_inserted += other.instances_inserted;
    }
}

enum FileOutcome {
    Parsed(FileMetadata),
    MissingUid,
    NotDicom,
    ReadFailed,
}

/// Index every DICOM file under `root` into `catalog`
#[tracing::instrument(skip(catalog, options), fields(workers = options.workers, append = options.append))]
pub async fn scan(root: &Path, catalog: &CatalogStore, options: ScanOptions) -> Result<ScanReport> {
    if !root.is_dir() {
        return Err(Error::usage(format!("{} is not a directory", root.display())));
    }
    let root = std::fs::canonicalize(root)?;

    if !options.append {
        catalog.reset().await?;
    }

    let walk_root = root.clone();
    let directories = tokio::task::spawn_blocking(move || group_by_directory(&walk_root)).await?;
    let total = directories.len();
    info!("📂 Scanning {} directories under {}", total, root.display());

    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let done = Arc::new(AtomicUsize::new(0));
    let origin = Origin::Archive(root.clone());

    let units = directories.into_iter().map(|(dir, files)| {
        let semaphore = Arc::clone(&semaphore);
        let done = Arc::clone(&done);
        let handle = catalog.handle();
        let origin = origin.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

            let unit_dir = dir.clone();
            let (mut report, parsed) =
                tokio::task::spawn_blocking(move || parse_directory(&unit_dir, files, &origin)).await?;
            let summary = handle.record_files(parsed).await?;
            report.series_created = summary.series_created;
            report.instances_inserted = summary.instances_inserted;

            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "[{}/{}] {}: {} of {} files indexed",
                finished,
                total,
                dir.display(),
                report.indexed,
                report.files_seen
            );
            Ok::<_, Error>(report)
        })
    });

    let mut report = ScanReport::default();
    for joined in join_all(units).await {
        report.merge(&joined??);
    }

    info!(
        "Scan of {} finished: {} files seen, {} indexed, {} skipped",
        root.display(),
        report.files_seen,
        report.indexed,
        report.skipped_missing_uid + report.skipped_not_dicom + report.failed_read
    );
    Ok(report)
}

fn group_by_directory(root: &Path) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let mut directories: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
        directories.entry(dir).or_default().push(path);
    }
    for files in directories.values_mut() {
        files.sort();
    }
    directories
}

fn parse_directory(dir: &Path, files: Vec<PathBuf>, origin: &Origin) -> (ScanReport, Vec<FileMetadata>) {
    let mut report = ScanReport {
        directories: 1,
        files_seen: files.len(),
        ..Default::default()
    };
    let mut parsed = Vec::with_capacity(files.len());

    for path in files {
        match parse_file(&path, origin) {
            FileOutcome::Parsed(file) => {
                report.indexed += 1;
                parsed.push(file);
            }
            FileOutcome::MissingUid => report.skipped_missing_uid += 1,
            FileOutcome::NotDicom => report.skipped_not_dicom += 1,
            FileOutcome::ReadFailed => report.failed_read += 1,
        }
    }

    debug!("Parsed {} of {} files in {}", report.indexed, report.files_seen, dir.display());
    (report, parsed)
}

/// Part 10 files carry "DICM" after the 128 byte preamble
fn has_dicom_preamble(path: &Path) -> std::io::Result<bool> {
    let mut header = [0u8; 132];
    let mut file = std::fs::File::open(path)?;
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header[128..] == b"DICM"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn parse_file(path: &Path, origin: &Origin) -> FileOutcome {
    match has_dicom_preamble(path) {
        Ok(true) => {}
        Ok(false) => {
            warn!("Skipping {}: not a DICOM file", path.display());
            return FileOutcome::NotDicom;
        }
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            return FileOutcome::ReadFailed;
        }
    }

    let obj: DefaultDicomObject = match OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
    {
        Ok(obj) => obj,
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            return FileOutcome::ReadFailed;
        }
    };

    let (Some(series_uid), Some(sop_uid)) = (
        string_value(&obj, tags::SERIES_INSTANCE_UID),
        string_value(&obj, tags::SOP_INSTANCE_UID),
    ) else {
        warn!("Skipping {}: missing SeriesInstanceUID or SOPInstanceUID", path.display());
        return FileOutcome::MissingUid;
    };

    let mut series = SeriesMetadata::new(series_uid, origin.clone());
    series.study_instance_uid = string_value(&obj, tags::STUDY_INSTANCE_UID);
    series.study_description = string_value(&obj, tags::STUDY_DESCRIPTION);
    series.series_description = string_value(&obj, tags::SERIES_DESCRIPTION);
    series.patient_name = string_value(&obj, tags::PATIENT_NAME);
    series.patient_id = string_value(&obj, tags::PATIENT_ID);
    series.study_date = string_value(&obj, tags::STUDY_DATE);

    FileOutcome::Parsed(FileMetadata {
        series,
        sop_instance_uid: sop_uid,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_detection() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.txt");
        std::fs::write(&short, b"hello").unwrap();
        assert!(!has_dicom_preamble(&short).unwrap());

        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        let fake = dir.path().join("fake.dcm");
        std::fs::write(&fake, &bytes).unwrap();
        assert!(has_dicom_preamble(&fake).unwrap());
    }

    #[test]
    fn test_grouping_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        for file in ["a/1", "a/2", "a/b/3", "4"] {
            std::fs::write(dir.path().join(file), b"x").unwrap();
        }
        let groups = group_by_directory(dir.path());
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&dir.path().join("a")].len(), 2);
    }
}
