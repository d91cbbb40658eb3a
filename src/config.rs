//! Job configuration loaded from YAML.
//!
//! A job file names the stream pool size, the modules on the path, the input
//! to read and the totals to check at teardown. Every section has defaults so
//! a file only needs the parts it changes.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::filters::ModuleSpec;
use crate::scheduler::{SchedulerConfig, TransitionScheduler};
use crate::source::JobInput;
use crate::validator::{ExpectationSpec, TransitionValidator};

/// Main job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Filter for the log file, in env_logger syntax
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    pub streams: usize,
    pub process_name: String,
    pub channel_capacity: usize,
    pub modules: Vec<ModuleSpec>,
    pub input: JobInput,
    pub validation: ValidationConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            log_level: None,
            streams: scheduler.streams,
            process_name: scheduler.process_name,
            channel_capacity: scheduler.channel_capacity,
            modules: Vec::new(),
            input: JobInput::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Teardown checks on transition totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Check job-level totals derived from the input
    pub strict: bool,
    /// Extra per-transition totals
    pub expect: Vec<ExpectationSpec>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strict: true,
            expect: Vec::new(),
        }
    }
}

impl JobConfig {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", env!("CARGO_PKG_NAME")));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_streams(self.streams)
            .with_process_name(self.process_name.clone())
            .with_channel_capacity(self.channel_capacity)
            .with_strict(self.validation.strict)
    }

    /// Extra validator from the `validation.expect` entries, if any
    pub fn validator(&self) -> Result<Option<TransitionValidator>> {
        if self.validation.expect.is_empty() {
            return Ok(None);
        }
        let mut validator = TransitionValidator::new();
        for spec in &self.validation.expect {
            validator = validator.expect(spec.scope, spec.transition, spec.expectation()?);
        }
        Ok(Some(validator))
    }

    /// Scheduler with every configured module registered
    pub fn build_scheduler(&self) -> Result<TransitionScheduler> {
        let mut scheduler = TransitionScheduler::new(self.scheduler_config())?;
        for spec in &self.modules {
            spec.register(&mut scheduler)?;
        }
        if let Some(validator) = self.validator()? {
            scheduler = scheduler.with_validator(validator);
        }
        Ok(scheduler)
    }

    /// Check everything that can be checked without running the job
    pub fn check(&self) -> Result<()> {
        if self.modules.is_empty() {
            return Err(SchedulerError::Config("no modules configured".to_string()));
        }
        self.input.validate()?;
        self.build_scheduler().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Transition;
    use crate::filters::FilterSpec;
    use crate::scope::ScopeKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const JOB: &str = r#"
streams: 2
process_name: PROD1
modules:
  - label: testBeginRun
    type: begin_run
    transitions: 1
input:
  files:
    - runs:
        - run: 1
          lumis:
            - lumi: 1
              events: 4
validation:
  expect:
    - scope: run
      transition: begin
      exact: 1
"#;

    #[test]
    fn test_default_config() {
        let config = JobConfig::default();
        assert_eq!(config.streams, 3);
        assert_eq!(config.process_name, "TEST");
        assert_eq!(config.channel_capacity, 64);
        assert!(config.validation.strict);
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = JobConfig::from_yaml("streams: 5\n").unwrap();
        assert_eq!(config.streams, 5);
        assert_eq!(config.process_name, "TEST");
        assert!(config.validation.strict);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(JOB.as_bytes()).unwrap();

        let config = JobConfig::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.streams, 2);
        assert_eq!(config.process_name, "PROD1");
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].filter, FilterSpec::BeginRun { transitions: 1 });
        assert_eq!(config.input.totals().events, 4);
        assert_eq!(config.validation.expect[0].scope, ScopeKind::Run);
        assert_eq!(config.validation.expect[0].transition, Transition::Begin);
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let path = PathBuf::from("/nonexistent/streamscope/job.yml");
        let err = JobConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn test_malformed_yaml_is_yaml_error() {
        let err = JobConfig::from_yaml("streams: [one").unwrap_err();
        assert!(matches!(err, SchedulerError::Yaml(_)));
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = JobConfig::from_yaml(JOB).unwrap();
        let again = JobConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_scheduler_config_from_job() {
        let mut config = JobConfig::from_yaml(JOB).unwrap();
        config.validation.strict = false;
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.streams, 2);
        assert_eq!(scheduler.process_name, "PROD1");
        assert!(!scheduler.strict);
    }

    #[test]
    fn test_build_scheduler_registers_modules() {
        let config = JobConfig::from_yaml(JOB).unwrap();
        let scheduler = config.build_scheduler().unwrap();
        assert_eq!(scheduler.module_labels(), vec!["testBeginRun"]);
        assert!(config.validator().unwrap().is_some());
    }

    #[test]
    fn test_invalid_expectation_rejected() {
        let mut config = JobConfig::from_yaml(JOB).unwrap();
        config.validation.expect[0].exact = None;
        assert!(matches!(config.build_scheduler(), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_check_requires_modules() {
        let config = JobConfig::default();
        assert!(matches!(config.check(), Err(SchedulerError::Config(_))));
        JobConfig::from_yaml(JOB).unwrap().check().unwrap();
    }
}
