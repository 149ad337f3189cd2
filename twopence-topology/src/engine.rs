//! Topology lifecycle engine.
//!
//! Drives every instance of a compiled configuration through the backend,
//! recording each state the backend reached in the status file. Instances
//! are worked on concurrently; a failing instance never aborts the others,
//! and nothing is retried.

use crate::backend::{BackendDriver, ImageArtifact, StageOutcome};
use crate::error::{BackendError, TopologyError, TopologyResult};
use crate::state::{Checkpoint, InstanceState, Operation};
use crate::store::{NodeStatus, TopologyStatus, Workspace, WorkspaceLock};
use chrono::Utc;
use futures::future::join_all;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use twopence_config::{
    CompiledConfig, ConfigError, InstanceConfig, PlannedStage, RecipeAssembler, RunContext,
    StageFilter, StagePlan,
};

/// Options of [`TopologyEngine::create`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Stop and destroy existing instances instead of refusing
    pub auto_destroy: bool,
    /// Provision for an image build
    pub image_build: bool,
}

/// Disagreement between the status file and the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Node name
    pub node: String,
    /// State in the status file
    pub recorded: InstanceState,
    /// State reported by the backend, now recorded
    pub observed: InstanceState,
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: recorded as {} but backend reports {}",
            self.node, self.recorded, self.observed
        )
    }
}

/// How far an instance got
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Every planned stage ran
    Completed,
    /// Stopped at a reboot checkpoint; continue with `resume`
    RebootPending(Checkpoint),
    /// Booted
    Started,
    /// Removed from the backend
    Destroyed,
}

/// Result of one instance
#[derive(Debug)]
pub struct NodeOutcome {
    /// Node name
    pub node: String,
    /// What happened
    pub result: TopologyResult<Progress>,
}

/// Per-instance results of a lifecycle operation
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Mismatches found by the initial detection
    pub reconciliations: Vec<Reconciliation>,
    /// One entry per instance worked on
    pub outcomes: Vec<NodeOutcome>,
}

impl ProvisionReport {
    /// Whether every instance succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Instances that failed.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &TopologyError)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.result {
            Ok(_) => None,
            Err(err) => Some((outcome.node.as_str(), err)),
        })
    }

    /// Instances waiting at a reboot checkpoint.
    pub fn pending(&self) -> impl Iterator<Item = (&str, &Checkpoint)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.result {
            Ok(Progress::RebootPending(checkpoint)) => Some((outcome.node.as_str(), checkpoint)),
            _ => None,
        })
    }

    fn log(&self, operation: &str) {
        for (node, err) in self.failures() {
            warn!("{operation} failed for {node}: {err}");
        }
        for (node, checkpoint) in self.pending() {
            info!("{node}: {checkpoint}");
        }
    }
}

fn next_state(node: &NodeStatus, operation: Operation) -> TopologyResult<InstanceState> {
    node.state
        .transition(operation)
        .ok_or_else(|| TopologyError::InvalidTransition {
            node: node.name.clone(),
            state: node.state,
            operation,
        })
}

/// Lifecycle engine of one workspace
pub struct TopologyEngine<B: BackendDriver> {
    workspace: Workspace,
    backend: B,
    compiled: CompiledConfig,
    assembler: RecipeAssembler,
    status: Mutex<TopologyStatus>,
    _lock: WorkspaceLock,
}

impl<B: BackendDriver> fmt::Debug for TopologyEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyEngine")
            .field("workspace", &self.workspace)
            .field("backend", &self.backend.kind())
            .field("nodes", &self.compiled.nodes.len())
            .finish_non_exhaustive()
    }
}

impl<B: BackendDriver> TopologyEngine<B> {
    /// Lock the workspace and load its status.
    ///
    /// # Errors
    ///
    /// `WorkspaceBusy`, or an unreadable status file.
    pub fn open(
        workspace: Workspace,
        backend: B,
        compiled: CompiledConfig,
        assembler: RecipeAssembler,
    ) -> TopologyResult<Self> {
        let lock = workspace.lock()?;
        let mut status = workspace.load_status(backend.kind())?;
        if compiled.testcase.is_some() {
            status.testcase.clone_from(&compiled.testcase);
        }
        status.parameters.clone_from(&compiled.parameters);

        Ok(Self {
            workspace,
            backend,
            compiled,
            assembler,
            status: Mutex::new(status),
            _lock: lock,
        })
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current records.
    pub async fn status(&self) -> TopologyStatus {
        self.status.lock().await.clone()
    }

    async fn record(&self, node: &NodeStatus) -> TopologyResult<()> {
        let mut status = self.status.lock().await;
        let _ = status.nodes.insert(node.name.clone(), node.clone());
        self.workspace.save_status(&status)
    }

    async fn forget(&self, name: &str) -> TopologyResult<()> {
        let mut status = self.status.lock().await;
        let _ = status.nodes.remove(name);
        self.workspace.save_status(&status)
    }

    async fn node(&self, name: &str) -> TopologyResult<NodeStatus> {
        self.status
            .lock()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    async fn nodes_where(&self, filter: impl Fn(&NodeStatus) -> bool) -> Vec<NodeStatus> {
        self.status
            .lock()
            .await
            .nodes
            .values()
            .filter(|node| filter(node))
            .cloned()
            .collect()
    }

    fn config(&self, name: &str) -> TopologyResult<&InstanceConfig> {
        self.compiled
            .node(name)
            .filter(|config| !config.skeleton)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    fn plans(&self, image_build: bool) -> TopologyResult<Vec<(&InstanceConfig, StagePlan)>> {
        if self.compiled.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".to_string()).into());
        }
        let context = RunContext {
            image_build,
            ..RunContext::default()
        };
        self.compiled
            .nodes
            .iter()
            .map(|config| {
                if config.skeleton {
                    return Err(TopologyError::UnknownNode(config.name.clone()));
                }
                Ok((config, self.assembler.assemble(config, &context)?))
            })
            .collect()
    }

    /// Ask the backend about every configured or recorded instance and
    /// bring the status file in line with it.
    ///
    /// # Errors
    ///
    /// Backend failures and status write errors; mismatches are only logged.
    pub async fn detect(&self) -> TopologyResult<Vec<Reconciliation>> {
        let records = {
            let status = self.status.lock().await;
            let mut records: Vec<NodeStatus> = status.nodes.values().cloned().collect();
            for config in &self.compiled.nodes {
                if !status.nodes.contains_key(&config.name) {
                    let mut record = NodeStatus::unknown(&config.name);
                    let dir = self.workspace.node_dir(&config.name);
                    let _ = record.handle.insert("dir".to_string(), dir.display().to_string());
                    records.push(record);
                }
            }
            records
        };

        let observed = self.backend.detect(&records).await?;

        let mut status = self.status.lock().await;
        let mut mismatches = Vec::new();
        let mut changed = false;
        for instance in observed {
            let recorded = status
                .nodes
                .get(&instance.name)
                .map_or(InstanceState::Absent, |node| node.state);

            if !recorded.agrees_with(instance.state) {
                let mismatch = Reconciliation {
                    node: instance.name.clone(),
                    recorded,
                    observed: instance.state,
                };
                warn!("{mismatch}");
                mismatches.push(mismatch);
                changed = true;

                if !status.nodes.contains_key(&instance.name) {
                    let record = records
                        .iter()
                        .find(|r| r.name == instance.name)
                        .cloned()
                        .unwrap_or_else(|| NodeStatus::unknown(&instance.name));
                    let _ = status.nodes.insert(instance.name.clone(), record);
                }
                if let Some(node) = status.nodes.get_mut(&instance.name) {
                    node.state = instance.state;
                    if !instance.state.exists() {
                        node.checkpoint = None;
                        node.interfaces.clear();
                        node.target = None;
                    }
                }
            }

            if let Some(node) = status.nodes.get_mut(&instance.name) {
                for (key, value) in instance.handle {
                    if node.handle.get(&key) != Some(&value) {
                        let _ = node.handle.insert(key, value);
                        changed = true;
                    }
                }
            }
        }

        if changed {
            self.workspace.save_status(&status)?;
        }
        debug!("Detected {} instances, {} mismatches", records.len(), mismatches.len());
        Ok(mismatches)
    }

    /// Create, start and provision every instance.
    ///
    /// Existing instances make this fail before any instance is touched,
    /// unless `auto_destroy` is set.
    ///
    /// # Errors
    ///
    /// Recipe errors, `InstancesExist`, `StillRunning`, and failures while
    /// clearing existing instances. Per-instance provisioning failures are
    /// reported in the returned [`ProvisionReport`].
    pub async fn create(&self, options: CreateOptions) -> TopologyResult<ProvisionReport> {
        let plans = self.plans(options.image_build)?;
        let reconciliations = self.detect().await?;

        let existing = self.status.lock().await.existing();
        if !existing.is_empty() {
            if !options.auto_destroy {
                return Err(TopologyError::InstancesExist(existing));
            }
            warn!("Destroying existing instances: {}", existing.join(", "));
            self.stop_running().await?;
            for name in &existing {
                self.destroy_node(name).await?;
            }
        }

        let outcomes = join_all(plans.iter().map(|(config, plan)| async move {
            NodeOutcome {
                node: config.name.clone(),
                result: self.provision(config, plan, options.image_build).await,
            }
        }))
        .await;

        let report = ProvisionReport {
            reconciliations,
            outcomes,
        };
        report.log("create");
        Ok(report)
    }

    async fn provision(
        &self,
        config: &InstanceConfig,
        plan: &StagePlan,
        image_build: bool,
    ) -> TopologyResult<Progress> {
        let mut node = NodeStatus::for_config(config, image_build)?;

        let prepared = next_state(&node, Operation::Prepare)?;
        let dir = self.workspace.node_dir(&config.name);
        node.handle = self.backend.prepare(config, plan, &dir).await?;
        node.state = prepared;
        self.record(&node).await?;
        info!("{}: prepared", node.name);

        self.boot(&mut node).await?;
        self.run_stages(&mut node, plan.stages.iter(), plan.total).await
    }

    async fn boot(&self, node: &mut NodeStatus) -> TopologyResult<()> {
        let running = next_state(node, Operation::Start)?;
        let info = self.backend.start(node).await?;
        node.handle.extend(info.handle);
        node.interfaces = info.interfaces;
        node.target = info.target;
        node.start_time = Some(Utc::now());
        node.state = running;
        self.record(node).await?;
        info!(
            "{}: running{}",
            node.name,
            node.target.as_deref().map(|t| format!(" at {t}")).unwrap_or_default()
        );
        Ok(())
    }

    async fn run_stages<'p, I>(
        &self,
        node: &mut NodeStatus,
        stages: I,
        total: usize,
    ) -> TopologyResult<Progress>
    where
        I: IntoIterator<Item = &'p PlannedStage>,
    {
        for stage in stages {
            let _ = next_state(node, Operation::RunStage)?;
            info!("{}: stage {} ({} of {total})", node.name, stage.name, stage.index + 1);

            let outcome = self.backend.run_stage(node, stage).await?;
            if stage.only == StageFilter::Once {
                let _ = node.once_done.insert(stage.name.clone());
            }

            if outcome == StageOutcome::RebootRequired {
                let checkpoint = Checkpoint {
                    stage: stage.name.clone(),
                    index: stage.index,
                    total,
                };
                node.checkpoint = Some(checkpoint.clone());
                self.record(node).await?;
                return Ok(Progress::RebootPending(checkpoint));
            }
            self.record(node).await?;
        }

        node.checkpoint = None;
        self.record(node).await?;
        Ok(Progress::Completed)
    }

    /// Continue provisioning instances waiting at a reboot checkpoint.
    ///
    /// # Errors
    ///
    /// Detection failures. Per-instance failures, including instances that
    /// are not running, are reported in the returned [`ProvisionReport`].
    pub async fn resume(&self) -> TopologyResult<ProvisionReport> {
        let reconciliations = self.detect().await?;
        let pending = self.nodes_where(|node| node.checkpoint.is_some()).await;
        if pending.is_empty() {
            info!("No instance is waiting for a reboot");
        }

        let outcomes = join_all(pending.into_iter().map(|node| async move {
            let name = node.name.clone();
            NodeOutcome {
                node: name,
                result: self.resume_node(node).await,
            }
        }))
        .await;

        let report = ProvisionReport {
            reconciliations,
            outcomes,
        };
        report.log("resume");
        Ok(report)
    }

    async fn resume_node(&self, mut node: NodeStatus) -> TopologyResult<Progress> {
        let Some(checkpoint) = node.checkpoint.clone() else {
            return Ok(Progress::Completed);
        };
        if node.state != InstanceState::Running {
            return Err(TopologyError::ReconciliationMismatch {
                node: node.name.clone(),
                recorded: InstanceState::Running,
                observed: node.state,
            });
        }

        let config = self.config(&node.name)?;
        let digest = config.digest()?;
        if node.config_digest.as_deref() != Some(digest.as_str()) {
            warn!("{}: configuration changed since the instance was created", node.name);
        }

        let context = RunContext {
            image_build: node.built,
            once_done: node.once_done.clone(),
        };
        let plan = self.assembler.assemble(config, &context)?;
        info!("{}: resuming after stage {}", node.name, checkpoint.stage);
        self.run_stages(&mut node, plan.remaining_after(checkpoint.index), plan.total)
            .await
    }

    /// Boot every prepared or stopped instance.
    ///
    /// # Errors
    ///
    /// Detection failures; per-instance failures are reported.
    pub async fn start(&self) -> TopologyResult<ProvisionReport> {
        let reconciliations = self.detect().await?;
        let startable = self
            .nodes_where(|node| matches!(node.state, InstanceState::Prepared | InstanceState::Stopped))
            .await;

        let outcomes = join_all(startable.into_iter().map(|mut node| async move {
            let result = self.boot(&mut node).await.map(|()| Progress::Started);
            NodeOutcome {
                node: node.name,
                result,
            }
        }))
        .await;

        let report = ProvisionReport {
            reconciliations,
            outcomes,
        };
        report.log("start");
        Ok(report)
    }

    /// Stop every running instance. Returns the stopped instances.
    ///
    /// # Errors
    ///
    /// `StillRunning` if any instance is still running afterwards.
    pub async fn stop(&self) -> TopologyResult<Vec<String>> {
        let _ = self.detect().await?;
        self.stop_running().await
    }

    async fn stop_node(&self, node: &mut NodeStatus) -> TopologyResult<()> {
        let stopped = next_state(node, Operation::Stop)?;
        self.backend.stop(node).await?;
        node.state = stopped;
        node.target = None;
        self.record(node).await?;
        info!("{}: stopped", node.name);
        Ok(())
    }

    async fn stop_running(&self) -> TopologyResult<Vec<String>> {
        let running = self
            .nodes_where(|node| node.state == InstanceState::Running)
            .await;

        let results = join_all(running.into_iter().map(|mut node| async move {
            let result = self.stop_node(&mut node).await;
            (node.name, result)
        }))
        .await;

        let mut stopped = Vec::new();
        for (name, result) in results {
            match result {
                Ok(()) => stopped.push(name),
                Err(err) => warn!("{name}: stop failed: {err}"),
            }
        }

        let _ = self.detect().await?;
        let still = self.status.lock().await.nodes_in(InstanceState::Running);
        if !still.is_empty() {
            return Err(TopologyError::StillRunning(still));
        }
        Ok(stopped)
    }

    async fn destroy_node(&self, name: &str) -> TopologyResult<()> {
        let node = self.node(name).await?;
        let _ = next_state(&node, Operation::Destroy)?;
        self.backend.destroy(&node).await?;
        self.forget(name).await?;
        info!("{name}: destroyed");
        Ok(())
    }

    /// Stop and destroy every instance, including ones no longer configured.
    ///
    /// With `zap`, the status file and the BOM are removed as well once all
    /// instances are gone.
    ///
    /// # Errors
    ///
    /// Detection failures and `StillRunning`; per-instance failures are
    /// reported.
    pub async fn destroy(&self, zap: bool) -> TopologyResult<ProvisionReport> {
        let reconciliations = self.detect().await?;
        let _ = self.stop_running().await?;

        let gone = self.nodes_where(|node| !node.state.exists()).await;
        for node in &gone {
            self.forget(&node.name).await?;
        }

        let existing = self.status.lock().await.existing();
        let outcomes = join_all(existing.into_iter().map(|name| async move {
            let result = self.destroy_node(&name).await.map(|()| Progress::Destroyed);
            NodeOutcome { node: name, result }
        }))
        .await;

        let report = ProvisionReport {
            reconciliations,
            outcomes,
        };
        report.log("destroy");

        if zap {
            if report.is_success() {
                self.workspace.zap()?;
            } else {
                warn!("Keeping status file and BOM; not every instance was destroyed");
            }
        }
        Ok(report)
    }

    /// Export the single instance of the topology as image `target`.
    ///
    /// # Errors
    ///
    /// `PackageRefused` unless exactly one instance exists, plus backend
    /// failures.
    pub async fn package(&self, node: Option<&str>, target: &str) -> TopologyResult<ImageArtifact> {
        let _ = self.detect().await?;
        let candidates = self
            .nodes_where(|n| matches!(n.state, InstanceState::Running | InstanceState::Stopped))
            .await;
        let [candidate] = candidates.as_slice() else {
            return Err(BackendError::PackageRefused {
                count: candidates.len(),
            }
            .into());
        };
        let mut candidate = candidate.clone();
        if let Some(name) = node
            && name != candidate.name
        {
            return Err(TopologyError::UnknownNode(name.to_string()));
        }
        let config = self.config(&candidate.name)?;

        if candidate.state == InstanceState::Running {
            self.stop_node(&mut candidate).await?;
        }

        let packaged = next_state(&candidate, Operation::Package)?;
        let artifact = self
            .backend
            .package(&candidate, config, target, self.workspace.root())
            .await?;
        candidate.state = packaged;
        self.record(&candidate).await?;
        info!(
            "{}: packaged as {} ({})",
            candidate.name,
            artifact.name,
            artifact.metadata.display()
        );
        Ok(artifact)
    }
}
