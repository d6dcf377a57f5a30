use crate::config::{FeedbackConfig, SchedulerConfig, SystemSpec, WorkflowConfig};
use itertools::Itertools;
use std::{
    process::{Command, ExitStatus},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to spawn the workflow tool for {system}")]
    SpawnWorkflow {
        system: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Workflow invocation for {system} exited with {status}")]
    WorkflowFailed { system: String, status: ExitStatus },
}

/// Evenly partition the submission budget over `n_systems`. Floor division,
/// the remainder is dropped rather than redistributed.
pub fn per_system_allocation(total: u64, n_systems: usize) -> u64 {
    if n_systems == 0 {
        // preflight rejects an empty system map before dispatch can run
        return 0;
    }
    total / n_systems as u64
}

/// A fully rendered workflow command line for one system
#[derive(Debug, Clone)]
pub struct WorkflowInvocation {
    pub system: String,
    pub args: Vec<String>,
}

impl WorkflowInvocation {
    /// Render the argument vector for one system. Every chemistry flag
    /// comes from that system's record alone, the trailing operational
    /// flags are shared across all invocations of a run.
    pub fn build(
        workflow: &WorkflowConfig,
        scheduler: &SchedulerConfig,
        name: &str,
        system: &SystemSpec,
        max_submit: u64,
    ) -> Self {
        let task = system.task.as_ref().unwrap_or(&workflow.task);

        let mut args = vec![
            String::from("--module"),
            workflow.module.clone(),
            task.clone(),
            String::from("--ads-list"),
            ads_list_literal(&system.adsorbates),
            String::from("--prediction-min"),
            system.prediction_min.to_string(),
            String::from("--prediction-max"),
            system.prediction_max.to_string(),
            String::from("--prediction-target"),
            system.prediction_target.to_string(),
            String::from("--predictions-location"),
            system.predictions.to_string_lossy().into_owned(),
            String::from("--priority"),
            system.priority.to_string(),
            String::from("--block"),
            system.block.clone(),
            String::from("--xc"),
            system.xc.clone(),
        ];

        if let Some(n_sigmas) = system.n_sigmas {
            args.push(String::from("--n-sigmas"));
            args.push(n_sigmas.to_string());
        }
        if let Some(max_atoms) = system.max_atoms {
            args.push(String::from("--max-atoms"));
            args.push(max_atoms.to_string());
        }

        args.push(String::from("--max-submit"));
        args.push(max_submit.to_string());

        if let Some(host) = &scheduler.host {
            args.push(String::from("--scheduler-host"));
            args.push(host.clone());
        }
        args.extend([
            String::from("--workers"),
            scheduler.workers.to_string(),
            String::from("--log-level"),
            scheduler.log_level.clone(),
            String::from("--worker-timeout"),
            scheduler.worker_timeout.to_string(),
        ]);

        Self {
            system: String::from(name),
            args,
        }
    }
}

// Luigi list parameters are JSON literals on the command line
fn ads_list_literal(adsorbates: &[String]) -> String {
    serde_json::to_string(adsorbates).unwrap()
}

/// Issues one workflow invocation per configured system, strictly in order
pub struct Dispatcher {
    config: FeedbackConfig,
}

impl Dispatcher {
    pub fn new(config: FeedbackConfig) -> Self {
        Self { config }
    }

    /// Split `total_submissions` over the configured systems and run the
    /// workflow tool once per system. Later systems still run when an
    /// earlier invocation fails; the last failure is returned once every
    /// system has been issued.
    pub fn dispatch(&self, total_submissions: u64) -> Result<(), DispatchError> {
        let total_systems = self.config.systems.len();
        let max_submit = per_system_allocation(total_submissions, total_systems);
        info!(
            "Splitting {total_submissions} submissions over {total_systems} systems, up to {max_submit} each"
        );

        let mut last_failure = None;
        for (processed, (name, system)) in self.config.systems.iter().enumerate() {
            if max_submit == 0 {
                warn!("Skipping {name}: the budget allocates no submissions to it");
                continue;
            }

            let invocation = WorkflowInvocation::build(
                &self.config.workflow,
                &self.config.scheduler,
                name,
                system,
                max_submit,
            );
            if let Err(e) = self.run(invocation) {
                error!("{e}");
                last_failure = Some(e);
            }
            info!("Done with {}/{total_systems}", processed + 1);
        }

        match last_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run(&self, invocation: WorkflowInvocation) -> Result<(), DispatchError> {
        debug!(
            "Requesting submissions for {} with {} {}",
            invocation.system,
            self.config.workflow.exec.to_string_lossy(),
            invocation.args.iter().join(" ")
        );

        let start = Instant::now();
        let output = Command::new(&self.config.workflow.exec)
            .args(invocation.args.iter())
            .output()
            .map_err(|source| DispatchError::SpawnWorkflow {
                system: invocation.system.clone(),
                source,
            })?;
        let elapsed = start.elapsed();

        debug!(
            "Finished {} in {} ms | status: {}",
            invocation.system,
            elapsed.as_millis(),
            output.status.success()
        );
        trace!("Output: {}", String::from_utf8_lossy(&output.stdout));

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                warn!("Workflow tool stderr for {}: {}", invocation.system, stderr.trim());
            }
            Err(DispatchError::WorkflowFailed {
                system: invocation.system,
                status: output.status,
            })
        }
    }
}
