// ==============================================================================
// project.rs - Project Lifecycle
// ==============================================================================
// Description: Project directory creation, discovery and database handles
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Directory layout:
//   project.json           name, creation time, crate version
//   settings.json          runtime settings (optional)
//   <name>.proj            project database
//   <name>_genotype.DB     genotype database
//   cache/                 scratch space for sample caches
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::error::{ConfigError, PipelineError, PipelineResult};
use crate::settings::Settings;
use crate::store::{check_identifier, GenotypeStore, ProjectStore};

const PROJECT_FILE: &str = "project.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub info: ProjectInfo,
    pub settings: Settings,
}

impl Project {
    /// Create a project in `dir`, which must not already hold one
    pub fn init(dir: &Path, name: &str) -> PipelineResult<Self> {
        check_identifier(name)?;
        if dir.join(PROJECT_FILE).exists() {
            return Err(ConfigError::Setting(format!(
                "a project already exists in {}",
                dir.display()
            ))
            .into());
        }
        std::fs::create_dir_all(dir)?;

        let info = ProjectInfo {
            name: name.to_string(),
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        std::fs::write(
            dir.join(PROJECT_FILE),
            serde_json::to_string_pretty(&info).map_err(ConfigError::from)?,
        )?;
        let settings = Settings::default();
        settings.save(&dir.join(SETTINGS_FILE))?;

        let project = Self {
            dir: dir.to_path_buf(),
            info,
            settings,
        };
        let store = project.store()?;
        store.set_metadata("name", name)?;
        store.set_metadata("created_at", &project.info.created_at.to_rfc3339())?;
        store.set_metadata("version", &project.info.version)?;
        project.genotypes()?;

        info!("Created project {} in {}", name, dir.display());
        Ok(project)
    }

    pub fn open(dir: &Path) -> PipelineResult<Self> {
        let path = dir.join(PROJECT_FILE);
        if !path.exists() {
            return Err(ConfigError::Setting(format!("no project found in {}", dir.display())).into());
        }
        let text = std::fs::read_to_string(&path)?;
        let info: ProjectInfo = serde_json::from_str(&text).map_err(ConfigError::from)?;
        let settings = Settings::load(&dir.join(SETTINGS_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            info,
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn project_db(&self) -> PathBuf {
        self.dir.join(format!("{}.proj", self.info.name))
    }

    pub fn genotype_db(&self) -> PathBuf {
        self.dir.join(format!("{}_genotype.DB", self.info.name))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.settings
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("cache"))
    }

    pub fn store(&self) -> PipelineResult<ProjectStore> {
        ProjectStore::open(&self.project_db(), self.settings.busy_timeout())
    }

    pub fn genotypes(&self) -> PipelineResult<GenotypeStore> {
        Ok(GenotypeStore::open(&self.genotype_db(), self.settings.busy_timeout())?)
    }

    /// Remove sample cache files left in the scratch directory
    pub fn clear_scratch(&self) -> PipelineResult<usize> {
        let dir = self.scratch_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?;
            let is_shelf = entry
                .path()
                .extension()
                .map(|ext| ext == "shelf" || ext == "shelf-wal" || ext == "shelf-shm")
                .unwrap_or(false);
            if entry.file_type().is_file() && is_shelf {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let created = Project::init(&root, "demo").unwrap();
        assert!(created.project_db().exists());
        assert!(created.genotype_db().exists());

        let opened = Project::open(&root).unwrap();
        assert_eq!(opened.name(), "demo");
        assert_eq!(
            opened.store().unwrap().metadata("name").unwrap().as_deref(),
            Some("demo")
        );
        assert_eq!(opened.scratch_dir(), root.join("cache"));
    }

    #[test]
    fn test_init_rejects_existing_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path(), "demo").unwrap();
        assert!(Project::init(dir.path(), "demo").is_err());
        let other = tempfile::tempdir().unwrap();
        assert!(Project::init(other.path(), "bad name").is_err());
        assert!(Project::open(&other.path().join("missing")).is_err());
    }

    #[test]
    fn test_clear_scratch_only_removes_shelves() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(dir.path(), "demo").unwrap();
        let scratch = project.scratch_dir();
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("geno_0.shelf"), b"x").unwrap();
        std::fs::write(scratch.join("notes.txt"), b"x").unwrap();
        assert_eq!(project.clear_scratch().unwrap(), 1);
        assert!(scratch.join("notes.txt").exists());
    }
}
