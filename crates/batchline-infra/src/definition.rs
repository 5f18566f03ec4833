//! Job definitions read from a directory of YAML or JSON files.
//!
//! A job named `payroll` lives in `{dir}/payroll.yaml`, `{dir}/payroll.yml`
//! or `{dir}/payroll.json`, checked in that order.

use std::path::{Path, PathBuf};

use batchline_core::engine::DefinitionError;
use batchline_core::operator::JobDefinitionSource;
use batchline_types::definition::JobDefinition;

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Loads job definitions from files on each request, so edits apply to the
/// next start or restart.
#[derive(Debug, Clone)]
pub struct DirectoryDefinitionSource {
    dir: PathBuf,
}

impl DirectoryDefinitionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, job_name: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{job_name}.{ext}")))
            .find(|path| path.is_file())
    }

    /// Names of every parseable definition in the directory, sorted.
    /// Unparseable files are skipped with a warning.
    pub fn discover(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !EXTENSIONS.contains(&ext) || !path.is_file() {
                continue;
            }
            match load_definition_file(&path) {
                Ok(def) => names.push(def.id),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable job definition"),
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

impl JobDefinitionSource for DirectoryDefinitionSource {
    fn load(&self, job_name: &str) -> Result<JobDefinition, DefinitionError> {
        if job_name.is_empty() || job_name.contains(['/', '\\']) || job_name.starts_with('.') {
            return Err(DefinitionError::UnknownJob(job_name.to_string()));
        }
        let path = self
            .locate(job_name)
            .ok_or_else(|| DefinitionError::UnknownJob(job_name.to_string()))?;

        let def = load_definition_file(&path).map_err(|reason| DefinitionError::Malformed {
            job: job_name.to_string(),
            reason,
        })?;
        if def.id != job_name {
            return Err(DefinitionError::Malformed {
                job: job_name.to_string(),
                reason: format!("{} declares job id '{}'", path.display(), def.id),
            });
        }
        tracing::debug!(job = job_name, path = %path.display(), "job definition loaded");
        Ok(def)
    }
}

/// Parse one definition file, choosing the format by extension.
pub fn load_definition_file(path: &Path) -> Result<JobDefinition, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
        _ => serde_yaml_ng::from_str(&content).map_err(|e| e.to_string()),
    }
}
