//! Remote catalog indexer
//!
//! Walks a project's accession list through a study-level then series-level
//! C-FIND cascade over a single association, upserting every series found.

use dicom_core::VR;
use dicom_dictionary_std::tags;
use dimse::types::{string_value, STUDY_ROOT_FIND};
use dimse::{Association, AssociationFactory, FindQuery, PresentationContext, QueryLevel};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, Origin, SeriesMetadata, UpsertOutcome};
use crate::project::Project;
use crate::{Error, Result};

/// Where in the target list to start
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumePoint {
    #[default]
    Start,
    /// 1-based line among the non-blank entries
    Line(usize),
    Accession(String),
}

impl ResumePoint {
    pub fn from_options(line: Option<usize>, accession: Option<String>) -> Result<Self> {
        match (line, accession) {
            (Some(_), Some(_)) => Err(Error::usage(
                "--resume-line and --resume-accession are mutually exclusive",
            )),
            (Some(line), None) => Ok(ResumePoint::Line(line)),
            (None, Some(accession)) => Ok(ResumePoint::Accession(accession)),
            (None, None) => Ok(ResumePoint::Start),
        }
    }

    /// Truncate `targets` to the entries at or after this point; falls back to
    /// the whole list when the point does not exist
    pub fn apply(&self, targets: Vec<String>) -> Vec<String> {
        let start = match self {
            ResumePoint::Start => return targets,
            ResumePoint::Line(line) => {
                if *line == 0 || *line > targets.len() {
                    warn!(
                        "Resume line {} is out of range (1..={}), indexing the full list",
                        line,
                        targets.len()
                    );
                    return targets;
                }
                line - 1
            }
            ResumePoint::Accession(accession) => match targets.iter().position(|t| t == accession) {
                Some(position) => position,
                None => {
                    warn!(
                        "Accession {} is not in the target list, indexing the full list",
                        accession
                    );
                    return targets;
                }
            },
        };
        info!("Resuming at entry {} of {}", start + 1, targets.len());
        targets.into_iter().skip(start).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Accession numbers processed
    pub accessions: usize,
    pub studies_found: usize,
    pub series_indexed: usize,
    /// Series matches without a SeriesInstanceUID
    pub series_skipped: usize,
    /// Accessions whose queries failed or found no study
    pub failures: usize,
}

/// Index the project's accession list from its remote node into `catalog`
#[tracing::instrument(skip_all, fields(project = %project.name, remote = %project.remote))]
pub async fn index_by_accession_list(
    project: &Project,
    catalog: &CatalogStore,
    factory: &dyn AssociationFactory,
    resume: ResumePoint,
) -> Result<IndexReport> {
    let targets = resume.apply(project.read_targets()?);
    let mut report = IndexReport::default();
    if targets.is_empty() {
        info!("Target list is empty, nothing to index");
        return Ok(report);
    }

    let contexts = vec![PresentationContext::uncompressed(STUDY_ROOT_FIND)];
    let mut association = factory.associate(&project.remote, contexts).await?;
    let origin = Origin::remote(&project.remote);

    let total = targets.len();
    for (i, accession) in targets.iter().enumerate() {
        report.accessions += 1;
        let result = index_accession(association.as_mut(), catalog, &origin, accession, &mut report).await;
        match result {
            Ok(series) => info!("[{}/{}] {}: {} series", i + 1, total, accession, series),
            Err(Error::Dimse(e)) if !e.is_association_lost() => {
                warn!("[{}/{}] {}: {}", i + 1, total, accession, e);
                report.failures += 1;
            }
            Err(e) => {
                tracing::error!("Indexing aborted at {} ({}/{}): {}", accession, i + 1, total, e);
                return Err(e);
            }
        }
    }

    if let Err(e) = association.release().await {
        warn!("Failed to release association: {}", e);
    }

    info!(
        "Indexed {} series from {} studies ({} accessions, {} failures)",
        report.series_indexed, report.studies_found, report.accessions, report.failures
    );
    Ok(report)
}

/// Returns the number of series upserted for one accession number
async fn index_accession(
    association: &mut dyn Association,
    catalog: &CatalogStore,
    origin: &Origin,
    accession: &str,
    report: &mut IndexReport,
) -> Result<usize> {
    let study_query = FindQuery::new(QueryLevel::Study)
        .with_key(tags::ACCESSION_NUMBER, VR::SH, accession)
        .returning(tags::STUDY_INSTANCE_UID, VR::UI);
    let studies = association.find(&study_query).await?;
    if !studies.status.is_success() {
        warn!("Study query for {} failed with status {}", accession, studies.status);
        report.failures += 1;
        return Ok(0);
    }

    let study_uids: BTreeSet<String> = studies
        .matches
        .iter()
        .filter_map(|m| string_value(m, tags::STUDY_INSTANCE_UID))
        .collect();
    if study_uids.is_empty() {
        warn!("No study found for accession {}", accession);
        report.failures += 1;
        return Ok(0);
    }
    report.studies_found += study_uids.len();

    let mut indexed = 0;
    for study_uid in &study_uids {
        let series_query = FindQuery::new(QueryLevel::Series)
            .with_key(tags::STUDY_INSTANCE_UID, VR::UI, study_uid.as_str())
            .returning(tags::SERIES_INSTANCE_UID, VR::UI)
            .returning(tags::STUDY_DESCRIPTION, VR::LO)
            .returning(tags::SERIES_DESCRIPTION, VR::LO)
            .returning(tags::PATIENT_NAME, VR::PN)
            .returning(tags::PATIENT_ID, VR::LO)
            .returning(tags::STUDY_DATE, VR::DA);
        let series = association.find(&series_query).await?;
        if !series.status.is_success() {
            warn!("Series query for study {} failed with status {}", study_uid, series.status);
            report.failures += 1;
            continue;
        }

        for found in &series.matches {
            let Some(series_uid) = string_value(found, tags::SERIES_INSTANCE_UID) else {
                warn!("Series match in study {} has no SeriesInstanceUID, skipping", study_uid);
                report.series_skipped += 1;
                continue;
            };

            let mut metadata = SeriesMetadata::new(series_uid, origin.clone());
            metadata.study_instance_uid =
                string_value(found, tags::STUDY_INSTANCE_UID).or_else(|| Some(study_uid.clone()));
            metadata.study_description = string_value(found, tags::STUDY_DESCRIPTION);
            metadata.series_description = string_value(found, tags::SERIES_DESCRIPTION);
            metadata.patient_name = string_value(found, tags::PATIENT_NAME);
            metadata.patient_id = string_value(found, tags::PATIENT_ID);
            metadata.study_date = string_value(found, tags::STUDY_DATE);

            let (key, outcome) = catalog.upsert_series(metadata).await?;
            if outcome == UpsertOutcome::Existing {
                debug!("Series {} already catalogued", key);
            }
            indexed += 1;
        }
    }

    report.series_indexed += indexed;
    Ok(indexed)
}
