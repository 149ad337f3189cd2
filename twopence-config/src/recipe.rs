//! Turns the stages of an instance config into an executable plan.
//!
//! The assembler only decides *what* runs; executing steps and handling
//! reboot checkpoints is up to the topology engine.

use crate::error::{ConfigError, ConfigResult};
use crate::model::{Invocation, StageFilter};
use crate::resolver::InstanceConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Shell scripts whose functions stages may call
#[derive(Debug, Clone, Default)]
pub struct ShellLibrary {
    search_paths: Vec<PathBuf>,
}

impl ShellLibrary {
    /// Library searching the given directories in order.
    #[must_use]
    pub fn new<I, P>(search_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: search_paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Directories searched for `<script>.sh`.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Locate `<script>.sh` and make sure it defines `function`.
    ///
    /// # Errors
    ///
    /// `UnknownReference` for a missing script or function, `Io` when the
    /// script cannot be read.
    pub fn resolve(&self, script: &str, function: &str) -> ConfigResult<PathBuf> {
        let file_name = format!("{script}.sh");
        let path = self
            .search_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file())
            .ok_or_else(|| ConfigError::UnknownReference {
                kind: "shell script",
                name: script.to_string(),
                context: None,
            })?;

        let source = fs::read_to_string(&path)?;
        if !defines_function(&source, function)? {
            return Err(ConfigError::UnknownReference {
                kind: "shell function",
                name: function.to_string(),
                context: Some(path.display().to_string()),
            });
        }
        Ok(path)
    }
}

fn defines_function(source: &str, function: &str) -> ConfigResult<bool> {
    let name = regex::escape(function);
    let pattern = Regex::new(&format!(r"(?m)^\s*(?:function\s+{name}\b|{name}\s*\(\s*\))"))
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
    Ok(pattern.is_match(source))
}

/// What kind of run the plan is assembled for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    /// Building an image; enables `only build` stages
    pub image_build: bool,
    /// `only once` stages that already completed on this instance
    pub once_done: BTreeSet<String>,
}

/// Resolved unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    /// Literal shell command
    Command {
        /// Command line
        command: String,
    },
    /// Function of a shell library script
    Function {
        /// Script name
        script: String,
        /// Script location on the host
        path: PathBuf,
        /// Function to call
        function: String,
    },
}

impl Step {
    /// Shell line running this step once the library is copied to `remote_dir`.
    #[must_use]
    pub fn shell_line(&self, remote_dir: &str) -> String {
        match self {
            Step::Command { command } => command.clone(),
            Step::Function { script, function, .. } => {
                format!(". {}/{script}.sh && {function}", remote_dir.trim_end_matches('/'))
            }
        }
    }

    /// Host path of the script backing this step.
    #[must_use]
    pub fn script_path(&self) -> Option<&Path> {
        match self {
            Step::Command { .. } => None,
            Step::Function { path, .. } => Some(path.as_path()),
        }
    }
}

/// A stage selected for execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    /// Position in the instance's full stage list
    pub index: usize,
    /// Stage name
    pub name: String,
    /// Reboot after the last step
    pub reboot: bool,
    /// Eligibility the stage was selected under
    pub only: StageFilter,
    /// Steps in order
    pub steps: Vec<Step>,
}

/// Ordered stages of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Node name
    pub node: String,
    /// Stages in the node's full stage list
    pub total: usize,
    /// Stages selected for this run
    pub stages: Vec<PlannedStage>,
}

impl StagePlan {
    /// Stages after the checkpoint at `index`.
    pub fn remaining_after(&self, index: usize) -> impl Iterator<Item = &PlannedStage> {
        self.stages.iter().filter(move |stage| stage.index > index)
    }

    /// Look up a planned stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Names of the selected stages.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    /// Whether nothing is left to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builds stage plans from instance configs
#[derive(Debug, Clone, Default)]
pub struct RecipeAssembler {
    library: ShellLibrary,
}

impl RecipeAssembler {
    /// Assembler resolving function calls through `library`.
    #[must_use]
    pub fn new(library: ShellLibrary) -> Self {
        Self { library }
    }

    /// Select and resolve the stages of one instance.
    ///
    /// # Errors
    ///
    /// Unknown scripts or functions.
    pub fn assemble(&self, config: &InstanceConfig, context: &RunContext) -> ConfigResult<StagePlan> {
        let mut stages = Vec::new();
        for (index, stage) in config.stages.iter().enumerate() {
            let eligible = match stage.filter() {
                StageFilter::Always => true,
                StageFilter::Once => !context.once_done.contains(&stage.name),
                StageFilter::Build => context.image_build,
            };
            if !eligible {
                debug!("{}: skipping stage {} ({:?})", config.name, stage.name, stage.filter());
                continue;
            }

            let steps = stage
                .invocations
                .iter()
                .map(|invocation| self.step(invocation))
                .collect::<ConfigResult<Vec<_>>>()?;

            stages.push(PlannedStage {
                index,
                name: stage.name.clone(),
                reboot: stage.reboot,
                only: stage.filter(),
                steps,
            });
        }

        Ok(StagePlan {
            node: config.name.clone(),
            total: config.stages.len(),
            stages,
        })
    }

    fn step(&self, invocation: &Invocation) -> ConfigResult<Step> {
        match invocation {
            Invocation::Command { command } => Ok(Step::Command {
                command: command.clone(),
            }),
            Invocation::Function { script, function } => Ok(Step::Function {
                script: script.clone(),
                path: self.library.resolve(script, function)?,
                function: function.clone(),
            }),
        }
    }
}
