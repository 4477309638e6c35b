//! Named units of work: a remote node, an accession target list and a catalog

use dimse::RemoteNode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::catalog::CatalogStore;
use crate::{Error, Result};

/// Persisted project descriptor, stored as `<home>/projects/<name>/<name>.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// One accession number per line
    pub target_list: PathBuf,
    pub catalog_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_study: Option<f64>,
    pub remote: RemoteNode,

    #[serde(skip)]
    dir: PathBuf,
}

impl Project {
    /// Create and persist a new project; fails if one with this name exists
    pub fn create(home: &Path, name: &str, remote: RemoteNode, target_list: &Path) -> Result<Self> {
        validate_name(name)?;
        remote.validate()?;

        let dir = project_dir(home, name);
        let descriptor = dir.join(format!("{}.toml", name));
        if descriptor.exists() {
            return Err(Error::Project(format!("project '{}' already exists", name)));
        }
        std::fs::create_dir_all(&dir)?;

        let target_list = std::fs::canonicalize(target_list).unwrap_or_else(|_| target_list.to_path_buf());
        let project = Self {
            name: name.to_string(),
            target_list,
            catalog_path: dir.join(format!("{}.redb", name)),
            cost_per_study: None,
            remote,
            dir,
        };
        project.save()?;

        tracing::info!("📁 Created project '{}' in {}", name, project.dir.display());
        Ok(project)
    }

    pub fn load(home: &Path, name: &str) -> Result<Self> {
        let dir = project_dir(home, name);
        let descriptor = dir.join(format!("{}.toml", name));
        if !descriptor.is_file() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&descriptor)?;
        let mut project: Project = toml::from_str(&text)?;
        project.dir = dir;
        Ok(project)
    }

    pub fn save(&self) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(self.descriptor_path(), text)?;
        Ok(())
    }

    /// Record the cost per study and persist the project
    pub fn set_cost_per_study(&mut self, cost: f64) -> Result<()> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(Error::usage(format!("invalid cost per study: {}", cost)));
        }
        self.cost_per_study = Some(cost);
        self.save()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(format!("{}.toml", self.name))
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(format!("{}_report.txt", self.name))
    }

    /// Accession numbers from the target list, blank lines dropped
    pub fn read_targets(&self) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(&self.target_list).map_err(|e| {
            Error::Project(format!(
                "cannot read target list {}: {}",
                self.target_list.display(),
                e
            ))
        })?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Open the project catalog, creating it on first use
    pub fn open_catalog(&self) -> Result<CatalogStore> {
        Ok(CatalogStore::open(&self.catalog_path)?)
    }

    /// Open the project catalog, which must already exist
    pub fn open_existing_catalog(&self) -> Result<CatalogStore> {
        CatalogStore::open_existing(&self.catalog_path)
    }
}

fn project_dir(home: &Path, name: &str) -> PathBuf {
    home.join("projects").join(name)
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::usage(format!(
            "invalid project name '{}': use letters, digits, '.', '_' or '-'",
            name
        )))
    }
}
