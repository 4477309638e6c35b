//! Project summary report

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::catalog::CatalogStore;
use crate::project::Project;
use crate::Result;

const TOP_DESCRIPTIONS: usize = 10;
const NO_DESCRIPTION: &str = "(no description)";

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectReport {
    pub project: String,
    /// Distinct StudyInstanceUIDs in the catalog
    pub studies_located: usize,
    /// Non-blank lines of the target list
    pub accessions: usize,
    pub unique_patients: usize,
    /// Most frequent series descriptions, most frequent first
    pub top_series_descriptions: Vec<(String, usize)>,
    pub cost_per_study: Option<f64>,
}

impl ProjectReport {
    pub fn estimated_cost(&self) -> Option<f64> {
        self.cost_per_study.map(|cost| cost * self.studies_located as f64)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Report for project: {}", self.project);
        let _ = writeln!(out, "{}", "=".repeat(30));
        let _ = writeln!(out, "Imaging sessions located: {} / {}", self.studies_located, self.accessions);
        let _ = writeln!(out, "Unique patient IDs: {}", self.unique_patients);
        let _ = writeln!(out);
        let _ = writeln!(out, "Top {} series descriptions:", TOP_DESCRIPTIONS);
        for (description, count) in &self.top_series_descriptions {
            let _ = writeln!(out, "  - {}: {}", description, count);
        }
        if let (Some(cost), Some(total)) = (self.cost_per_study, self.estimated_cost()) {
            let _ = writeln!(out);
            let _ = writeln!(out, "Estimated download cost:");
            let _ = writeln!(out, "  - Cost per study: ${:.2}", cost);
            let _ = writeln!(out, "  - Total estimated cost: ${:.2}", total);
        }
        out
    }
}

/// Summarise the project's catalog; a given cost is persisted into the project
#[tracing::instrument(skip_all, fields(project = %project.name))]
pub fn generate(project: &mut Project, catalog: &CatalogStore, cost_override: Option<f64>) -> Result<ProjectReport> {
    if let Some(cost) = cost_override {
        project.set_cost_per_study(cost)?;
    }

    let series = catalog.series()?;
    let studies: BTreeSet<&str> = series.iter().filter_map(|s| s.study_instance_uid.as_deref()).collect();
    let patients: BTreeSet<&str> = series.iter().filter_map(|s| s.patient_id.as_deref()).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in &series {
        *counts
            .entry(s.series_description.as_deref().unwrap_or(NO_DESCRIPTION))
            .or_default() += 1;
    }
    let mut top: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(description, count)| (description.to_string(), count))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(TOP_DESCRIPTIONS);

    Ok(ProjectReport {
        project: project.name.clone(),
        studies_located: studies.len(),
        accessions: project.read_targets()?.len(),
        unique_patients: patients.len(),
        top_series_descriptions: top,
        cost_per_study: project.cost_per_study,
    })
}

/// Render `report` into the project's report file and return its path
pub fn write_report(project: &Project, report: &ProjectReport) -> Result<PathBuf> {
    let path = project.report_path();
    std::fs::write(&path, report.render())?;
    tracing::info!("📝 Report written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Origin, SeriesMetadata};
    use dimse::RemoteNode;

    fn series(uid: &str, study: &str, patient: &str, description: Option<&str>) -> SeriesMetadata {
        let mut s = SeriesMetadata::new(uid, Origin::Remote("dimse://PACS@h:104".into()));
        s.study_instance_uid = Some(study.to_string());
        s.patient_id = Some(patient.to_string());
        s.series_description = description.map(str::to_string);
        s
    }

    #[tokio::test]
    async fn test_generate_and_render() {
        let home = tempfile::tempdir().unwrap();
        let targets = home.path().join("targets.txt");
        std::fs::write(&targets, "A1\nA2\n\nA3\n").unwrap();
        let mut project = Project::create(home.path(), "rpt", RemoteNode::new("PACS", "h", 104), &targets).unwrap();

        let catalog = project.open_catalog().unwrap();
        for s in [
            series("1.1", "1", "P1", Some("AX T1")),
            series("1.2", "1", "P1", Some("AX T2")),
            series("2.1", "2", "P2", Some("AX T1")),
            series("2.2", "2", "P2", None),
        ] {
            catalog.upsert_series(s).await.unwrap();
        }

        let report = generate(&mut project, &catalog, Some(25.0)).unwrap();
        assert_eq!(report.studies_located, 2);
        assert_eq!(report.accessions, 3);
        assert_eq!(report.unique_patients, 2);
        assert_eq!(report.top_series_descriptions[0], ("AX T1".to_string(), 2));
        assert_eq!(report.estimated_cost(), Some(50.0));

        let text = report.render();
        assert!(text.contains("Imaging sessions located: 2 / 3"));
        assert!(text.contains("Total estimated cost: $50.00"));

        let path = write_report(&project, &report).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), text);
        assert_eq!(Project::load(home.path(), "rpt").unwrap().cost_per_study, Some(25.0));
        catalog.close();
    }
}
