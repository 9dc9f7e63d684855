//! Scheduler configuration loading and management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Config file locations searched under the project root, in order.
pub const CONFIG_CANDIDATES: [&str; 3] = [
    ".conductor/config.yaml",
    ".conductor/config.yml",
    ".conductor/config.json",
];

/// Main configuration, loaded from .conductor/config.yaml (or .json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Component key -> glob patterns that component owns
    #[serde(default)]
    pub components: BTreeMap<String, Vec<String>>,

    /// Label names applied by triage
    #[serde(default)]
    pub labels: LabelsConfig,

    /// Maximum units of work in progress at once
    #[serde(rename = "parallelAgents", alias = "parallel_agents")]
    pub parallel_agents: usize,

    /// Issue body headings triage reads
    #[serde(default)]
    pub sections: SectionsConfig,

    /// Dispatch target configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// When scheduler bookkeeping is written relative to dispatch calls
    #[serde(default)]
    pub commit: CommitMode,

    /// Queue document (relative to project root)
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    /// Lock document (relative to project root)
    #[serde(default = "default_locks_path")]
    pub locks_path: PathBuf,

    /// Event log (relative to project root)
    #[serde(default = "default_events_path")]
    pub events_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsConfig {
    #[serde(default = "default_triaged_label")]
    pub triaged: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            triaged: default_triaged_label(),
        }
    }
}

/// Headings of the issue-form sections triage extracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionsConfig {
    pub component: String,
    pub complexity: String,
    pub hints: String,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self {
            component: "Component".to_string(),
            complexity: "Complexity".to_string(),
            hints: "Files".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// `repository_dispatch` event type sent for admitted work
    pub event_type: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_type: "agent-task".to_string(),
        }
    }
}

/// Crash-consistency policy for an admission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitMode {
    /// Persist once after the whole scan. A dispatch failure mid-pass
    /// leaves earlier dispatches unrecorded.
    #[default]
    EndOfPass,
    /// Persist each claim before its dispatch call. A dispatch failure
    /// leaves a recorded claim with no running work.
    PerAdmission,
    /// Never dispatch or persist; report what would be admitted. Selected
    /// by `schedule --dry-run`, not accepted from the config file.
    #[serde(skip_deserializing)]
    DryRun,
}

fn default_triaged_label() -> String {
    "triaged".to_string()
}
fn default_queue_path() -> PathBuf {
    PathBuf::from(".conductor/queue.json")
}
fn default_locks_path() -> PathBuf {
    PathBuf::from(".conductor/locks.json")
}
fn default_events_path() -> PathBuf {
    PathBuf::from(".conductor/events.jsonl")
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            components: BTreeMap::new(),
            labels: LabelsConfig::default(),
            parallel_agents: 1,
            sections: SectionsConfig::default(),
            dispatch: DispatchConfig::default(),
            commit: CommitMode::default(),
            queue_path: default_queue_path(),
            locks_path: default_locks_path(),
            events_path: default_events_path(),
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse a config document. JSON is valid YAML, so one parser covers both.
    pub fn parse(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Load from project root. A missing config is fatal: the component map
    /// and agent limit have no meaningful defaults.
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let path = Self::find(project_root).ok_or_else(|| {
            Error::Config(format!(
                "no config found under {} (expected one of {}); run `conductor init`",
                project_root.display(),
                CONFIG_CANDIDATES.join(", ")
            ))
        })?;
        let mut config = Self::load(&path)?;
        config.resolve_paths(project_root);
        Ok(config)
    }

    /// First existing config file under `project_root`.
    pub fn find(project_root: &Path) -> Option<PathBuf> {
        CONFIG_CANDIDATES
            .iter()
            .map(|c| project_root.join(c))
            .find(|p| p.is_file())
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.queue_path = project_root.join(&self.queue_path);
        self.locks_path = project_root.join(&self.locks_path);
        self.events_path = project_root.join(&self.events_path);
    }

    /// Globs configured for a component, empty when unknown.
    pub fn component_globs(&self, component: &str) -> &[String] {
        self.components
            .get(component)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
