use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

/// environment variable consulted when the config file leaves the
/// scheduler endpoint unset
pub const SCHEDULER_HOST_VAR: &str = "LUIGI_SCHEDULER_HOST";

// check if a path points to an executable file
fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        return Err(ConfigErrors::FileNotFound);
    }
    let metadata = std::fs::metadata(path)?;
    Ok((metadata.mode() & 0o111) != 0)
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    UnreadableConfig(std::io::Error),
    #[error("Failed to deserialize config file")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] std::io::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct FeedbackConfig {
    // the external workflow tool and the default task it should run
    pub workflow: WorkflowConfig,
    // operational flags shared by every invocation
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    // Systems as named parameter sets for the feedback task, one invocation each
    pub systems: BTreeMap<String, SystemSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    // either a bare name resolved over PATH or an explicit path
    #[serde(default = "default_workflow_exec")]
    pub exec: PathBuf,
    // Python module holding the wrapper tasks
    pub module: String,
    pub task: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // central scheduler endpoint; the flag is omitted entirely when neither
    // the config file nor the environment provides one
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    // seconds, passed through to the workflow tool as-is
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            host: None,
            workers: default_workers(),
            log_level: default_log_level(),
            worker_timeout: default_worker_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SystemSpec {
    // coadsorbates the feedback task should request relaxations for
    pub adsorbates: Vec<String>,
    pub prediction_min: f64,
    pub prediction_max: f64,
    pub prediction_target: f64,
    // serialized regressor the feedback task ranks candidates with
    pub predictions: PathBuf,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_block")]
    pub block: String,
    #[serde(default = "default_xc")]
    pub xc: String,
    // width divisor of the gaussian selection window
    #[serde(default)]
    pub n_sigmas: Option<f64>,
    #[serde(default)]
    pub max_atoms: Option<u64>,
    // override for the shared workflow task
    #[serde(default)]
    pub task: Option<String>,
}

/// How the feedback task orders candidate submissions
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Anything,
    Targeted,
    Random,
    Gaussian,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Anything => "anything",
            Self::Targeted => "targeted",
            Self::Random => "random",
            Self::Gaussian => "gaussian",
        };
        write!(f, "{name}")
    }
}

impl FeedbackConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents =
            std::fs::read_to_string(path).map_err(ConfigErrors::UnreadableConfig)?;
        let mut config: Self = serde_yaml::from_str(&contents)?;
        config.resolve_scheduler_host(std::env::var(SCHEDULER_HOST_VAR).ok());
        Ok(config)
    }

    /// merge the scheduler endpoint from the environment, the config file wins
    pub fn resolve_scheduler_host(&mut self, env_host: Option<String>) {
        if self.scheduler.host.is_none() {
            self.scheduler.host = env_host.filter(|host| !host.is_empty());
        }
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.systems.is_empty() {
            error!("No system was defined, there is nothing to split the submission budget over");
            contains_error = true;
        }

        if self.scheduler.workers == 0 {
            error!("scheduler.workers cannot be 0, the workflow tool would not run anything");
            contains_error = true;
        }

        if self.scheduler.worker_timeout == 0 {
            error!("scheduler.worker_timeout cannot be 0. Use a generous timeout instead of none at all");
            contains_error = true;
        }

        // bare names are resolved over PATH by the OS, only explicit paths
        // can be checked up front
        if self.workflow.exec.components().count() > 1 {
            match check_executable(&self.workflow.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "workflow.exec ({}) is not executable, this might cause problems",
                        self.workflow.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to find workflow.exec. Either not a file or not found at {}: {e}",
                        self.workflow.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        for (name, system) in self.systems.iter() {
            if system.adsorbates.is_empty() {
                error!("systems.{name}.adsorbates is empty, the feedback task needs at least one adsorbate");
                contains_error = true;
            }

            if system.prediction_min > system.prediction_max {
                error!(
                    "systems.{name}: prediction_min ({}) is above prediction_max ({})",
                    system.prediction_min, system.prediction_max
                );
                contains_error = true;
            } else if system.prediction_target < system.prediction_min
                || system.prediction_target > system.prediction_max
            {
                warn!(
                    "systems.{name}: prediction_target ({}) lies outside the prediction window",
                    system.prediction_target
                );
            }

            if let Some(n_sigmas) = system.n_sigmas {
                if n_sigmas <= 0.0 {
                    error!("systems.{name}.n_sigmas must be positive");
                    contains_error = true;
                }
            }

            if !system.predictions.is_file() {
                warn!(
                    "systems.{name}.predictions ({}) was not found here. The workflow tool may still find it on its own host",
                    system.predictions.to_string_lossy()
                );
            }
        }

        contains_error
    }
}

fn default_workflow_exec() -> PathBuf {
    PathBuf::from("luigi")
}

fn default_workers() -> u64 {
    1
}

fn default_log_level() -> String {
    String::from("WARNING")
}

fn default_worker_timeout() -> u64 {
    300
}

fn default_priority() -> Priority {
    Priority::Gaussian
}

fn default_block() -> String {
    String::from("no_block")
}

fn default_xc() -> String {
    String::from("rpbe")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
workflow:
  exec: luigi
  module: gaspy_feedback.feedback
  task: CoordcountAdsToEnergy

scheduler:
  host: hippo.cheme.cmu.edu
  workers: 1
  log_level: WARNING
  worker_timeout: 300

systems:
  co2rr:
    adsorbates: [CO]
    prediction_min: -2.62
    prediction_max: 0.38
    prediction_target: -0.67
    predictions: pkls/GP_energy_fr_coordcount_CO.pkl
    priority: gaussian
    n_sigmas: 6.0
  her:
    adsorbates: [H]
    prediction_min: -0.77
    prediction_max: 0.23
    prediction_target: -0.27
    predictions: pkls/GP_energy_fr_coordcount_H.pkl
"#;

    fn full_config() -> FeedbackConfig {
        serde_yaml::from_str(FULL_CONFIG).unwrap()
    }

    #[test]
    fn parse_full_config() {
        let config = full_config();

        assert_eq!(config.workflow.exec, PathBuf::from("luigi"));
        assert_eq!(config.workflow.module, "gaspy_feedback.feedback");
        assert_eq!(config.workflow.task, "CoordcountAdsToEnergy");
        assert_eq!(config.scheduler.host.as_deref(), Some("hippo.cheme.cmu.edu"));

        let names: Vec<_> = config.systems.keys().cloned().collect();
        assert_eq!(names, ["co2rr", "her"]);

        let co2rr = &config.systems["co2rr"];
        assert_eq!(co2rr.adsorbates, ["CO"]);
        assert_eq!(co2rr.prediction_target, -0.67);
        assert_eq!(co2rr.priority, Priority::Gaussian);
        assert_eq!(co2rr.n_sigmas, Some(6.0));
    }

    #[test]
    fn omitted_fields_fall_back_to_defaults() {
        let config = full_config();
        let her = &config.systems["her"];

        assert_eq!(her.priority, Priority::Gaussian);
        assert_eq!(her.block, "no_block");
        assert_eq!(her.xc, "rpbe");
        assert_eq!(her.n_sigmas, None);
        assert_eq!(her.max_atoms, None);
        assert_eq!(her.task, None);
    }

    #[test]
    fn scheduler_section_is_optional() {
        let config: FeedbackConfig = serde_yaml::from_str(
            r#"
workflow:
  module: gaspy_feedback.feedback
  task: RandomAdslabs
systems:
  her:
    adsorbates: [H]
    prediction_min: -0.77
    prediction_max: 0.23
    prediction_target: -0.27
    predictions: pkls/H.pkl
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.host, None);
        assert_eq!(config.scheduler.workers, 1);
        assert_eq!(config.scheduler.log_level, "WARNING");
        assert_eq!(config.scheduler.worker_timeout, 300);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<FeedbackConfig, _> = serde_yaml::from_str(
            r#"
workflow:
  module: gaspy_feedback.feedback
  task: RandomAdslabs
  typo_field: true
systems: {}
"#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn config_file_host_wins_over_environment() {
        let mut config = full_config();
        config.resolve_scheduler_host(Some(String::from("other.host")));

        assert_eq!(config.scheduler.host.as_deref(), Some("hippo.cheme.cmu.edu"));
    }

    #[test]
    fn environment_fills_in_missing_host() {
        let mut config = full_config();
        config.scheduler.host = None;

        config.resolve_scheduler_host(Some(String::from("other.host")));
        assert_eq!(config.scheduler.host.as_deref(), Some("other.host"));
    }

    #[test]
    fn empty_environment_host_is_ignored() {
        let mut config = full_config();
        config.scheduler.host = None;

        config.resolve_scheduler_host(Some(String::new()));
        assert_eq!(config.scheduler.host, None);

        config.resolve_scheduler_host(None);
        assert_eq!(config.scheduler.host, None);
    }

    #[test]
    fn preflight_accepts_full_config() {
        assert!(!full_config().preflight_checks());
    }

    #[test]
    fn preflight_rejects_empty_system_map() {
        let mut config = full_config();
        config.systems.clear();

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_rejects_inverted_prediction_window() {
        let mut config = full_config();
        config.systems.get_mut("her").unwrap().prediction_min = 1.0;

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_rejects_missing_adsorbates() {
        let mut config = full_config();
        config.systems.get_mut("co2rr").unwrap().adsorbates.clear();

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_rejects_zero_workers() {
        let mut config = full_config();
        config.scheduler.workers = 0;

        assert!(config.preflight_checks());
    }

    #[test]
    fn priority_names_match_the_workflow_tool() {
        for (priority, name) in [
            (Priority::Anything, "anything"),
            (Priority::Targeted, "targeted"),
            (Priority::Random, "random"),
            (Priority::Gaussian, "gaussian"),
        ] {
            assert_eq!(priority.to_string(), name);

            let parsed: Priority = serde_yaml::from_str(name).unwrap();
            assert_eq!(parsed, priority);
        }
    }
}
