//! Backend capability interface and the closed set of backends.

use crate::error::{BackendError, BackendResult};
use crate::podman::PodmanBackend;
use crate::runner::CommandRunner;
use crate::state::InstanceState;
use crate::store::{NetworkInterface, NodeStatus};
use crate::vagrant::VagrantBackend;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use twopence_config::{BackendSettings, ImageDescriptor, InstanceConfig, PlannedStage, StagePlan};
use twopence_curly::{Attribute, Block};

/// What the engine knows about an instance when talking to a backend
pub type InstanceRecord = NodeStatus;

/// Backend bookkeeping stored in the status file
pub type BackendHandle = BTreeMap<String, String>;

/// Port the test agent listens on inside instances
pub const TARGET_PORT: u16 = 4000;

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Virtual machines managed by vagrant
    Vagrant,
    /// Containers managed by podman
    Podman,
}

impl BackendKind {
    /// Name used in configuration and the BOM.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vagrant => "vagrant",
            BackendKind::Podman => "podman",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vagrant" => Ok(BackendKind::Vagrant),
            "podman" => Ok(BackendKind::Podman),
            other => Err(BackendError::NotFound(format!("backend {other}"))),
        }
    }
}

/// Backend view of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInstance {
    /// Node name
    pub name: String,
    /// State as reported by the backend
    pub state: InstanceState,
    /// Handle entries learned while detecting
    pub handle: BackendHandle,
}

impl ObservedInstance {
    /// Instance the backend knows nothing about.
    #[must_use]
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: InstanceState::Absent,
            handle: BackendHandle::new(),
        }
    }
}

/// What a started instance looks like
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartInfo {
    /// Handle entries to add or replace
    pub handle: BackendHandle,
    /// Network addresses
    pub interfaces: Vec<NetworkInterface>,
    /// Test target
    pub target: Option<String>,
}

impl StartInfo {
    /// Start info for an instance reachable at `address`.
    #[must_use]
    pub fn reachable(address: &str, prefix_len: Option<u8>) -> Self {
        Self {
            handle: BackendHandle::new(),
            interfaces: vec![NetworkInterface::from_address(address, prefix_len)],
            target: Some(target_for(address)),
        }
    }
}

/// `tcp:<address>:4000`, bracketing IPv6 addresses.
#[must_use]
pub fn target_for(address: &str) -> String {
    if address.contains(':') {
        format!("tcp:[{address}]:{TARGET_PORT}")
    } else {
        format!("tcp:{address}:{TARGET_PORT}")
    }
}

/// Result of running one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// All steps succeeded
    Completed,
    /// All steps succeeded and the instance is rebooting
    RebootRequired,
}

/// Image produced by `package`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Platform name of the new image
    pub name: String,
    /// Backend that produced it
    pub backend: BackendKind,
    /// Image descriptor to reference it with
    pub image: ImageDescriptor,
    /// Exported platform definition
    pub metadata: PathBuf,
}

/// Lifecycle capabilities of a backend
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> BackendKind;

    /// Query the state of instances. Read-only and idempotent.
    async fn detect(&self, records: &[InstanceRecord]) -> BackendResult<Vec<ObservedInstance>>;

    /// Create backend resources for an instance in `instance_dir`.
    async fn prepare(
        &self,
        config: &InstanceConfig,
        plan: &StagePlan,
        instance_dir: &Path,
    ) -> BackendResult<BackendHandle>;

    /// Boot a prepared or stopped instance.
    async fn start(&self, record: &InstanceRecord) -> BackendResult<StartInfo>;

    /// Run every step of a stage on a running instance.
    async fn run_stage(&self, record: &InstanceRecord, stage: &PlannedStage) -> BackendResult<StageOutcome>;

    /// Shut a running instance down.
    async fn stop(&self, record: &InstanceRecord) -> BackendResult<()>;

    /// Remove all backend resources of an instance.
    async fn destroy(&self, record: &InstanceRecord) -> BackendResult<()>;

    /// Export a stopped instance as image `target`, with its platform
    /// definition written to `<workspace>/<target>.platform`.
    async fn package(
        &self,
        record: &InstanceRecord,
        config: &InstanceConfig,
        target: &str,
        workspace: &Path,
    ) -> BackendResult<ImageArtifact>;

    /// Attributes of the `backend "<kind>" { }` block describing an image.
    fn render_platform_information(&self, image: &ImageDescriptor) -> Vec<(String, String)>;
}

/// One of the supported backends
#[derive(Debug)]
pub enum Backend {
    /// Vagrant boxes
    Vagrant(VagrantBackend),
    /// Podman containers
    Podman(PodmanBackend),
}

impl Backend {
    /// Create a backend from its kind and saved settings.
    ///
    /// # Errors
    ///
    /// Invalid settings.
    pub fn new(
        kind: BackendKind,
        settings: Option<&BackendSettings>,
        testcase: Option<&str>,
        runner: Arc<dyn CommandRunner>,
    ) -> BackendResult<Self> {
        let settings = Settings::parse(settings)?;
        Ok(match kind {
            BackendKind::Vagrant => Backend::Vagrant(VagrantBackend::new(runner, settings)),
            BackendKind::Podman => Backend::Podman(PodmanBackend::new(runner, settings, testcase)),
        })
    }

    fn driver(&self) -> &dyn BackendDriver {
        match self {
            Backend::Vagrant(backend) => backend,
            Backend::Podman(backend) => backend,
        }
    }
}

#[async_trait]
impl BackendDriver for Backend {
    fn kind(&self) -> BackendKind {
        self.driver().kind()
    }

    async fn detect(&self, records: &[InstanceRecord]) -> BackendResult<Vec<ObservedInstance>> {
        self.driver().detect(records).await
    }

    async fn prepare(
        &self,
        config: &InstanceConfig,
        plan: &StagePlan,
        instance_dir: &Path,
    ) -> BackendResult<BackendHandle> {
        self.driver().prepare(config, plan, instance_dir).await
    }

    async fn start(&self, record: &InstanceRecord) -> BackendResult<StartInfo> {
        self.driver().start(record).await
    }

    async fn run_stage(&self, record: &InstanceRecord, stage: &PlannedStage) -> BackendResult<StageOutcome> {
        self.driver().run_stage(record, stage).await
    }

    async fn stop(&self, record: &InstanceRecord) -> BackendResult<()> {
        self.driver().stop(record).await
    }

    async fn destroy(&self, record: &InstanceRecord) -> BackendResult<()> {
        self.driver().destroy(record).await
    }

    async fn package(
        &self,
        record: &InstanceRecord,
        config: &InstanceConfig,
        target: &str,
        workspace: &Path,
    ) -> BackendResult<ImageArtifact> {
        self.driver().package(record, config, target, workspace).await
    }

    fn render_platform_information(&self, image: &ImageDescriptor) -> Vec<(String, String)> {
        self.driver().render_platform_information(image)
    }
}

/// Settings shared by all backends, from `backend "<kind>" { ... }`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Instance template file
    pub template: Option<PathBuf>,
    /// Per-command timeout
    pub timeout: Option<Duration>,
    /// Network to attach instances to
    pub network: Option<String>,
    /// Provider passed to the backend tool
    pub provider: Option<String>,
}

impl Settings {
    /// Interpret saved settings.
    ///
    /// # Errors
    ///
    /// `Template` for a malformed timeout.
    pub fn parse(settings: Option<&BackendSettings>) -> BackendResult<Self> {
        let Some(settings) = settings else {
            return Ok(Self::default());
        };
        let block = &settings.block;
        let timeout = block
            .get("timeout")
            .map(|value| {
                value.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    BackendError::Template(format!("backend {}: invalid timeout {value}", settings.name))
                })
            })
            .transpose()?;

        Ok(Self {
            template: block.get("template").map(PathBuf::from),
            timeout,
            network: block.get("network").map(str::to_string),
            provider: block.get("provider").map(str::to_string),
        })
    }
}

/// Directory holding an instance's backend files.
pub(crate) fn instance_dir(record: &InstanceRecord) -> BackendResult<PathBuf> {
    record
        .handle("dir")
        .map(PathBuf::from)
        .ok_or_else(|| BackendError::NotFound(format!("instance directory of {}", record.name)))
}

/// Copy the shell library scripts a plan uses into `<instance_dir>/provision`.
pub(crate) fn stage_scripts(plan: &StagePlan, instance_dir: &Path) -> BackendResult<PathBuf> {
    let dest = instance_dir.join("provision");
    fs::create_dir_all(&dest).map_err(BackendError::io(&dest))?;
    for step in plan.stages.iter().flat_map(|stage| &stage.steps) {
        if let Some(path) = step.script_path()
            && let Some(file_name) = path.file_name()
        {
            let copy = dest.join(file_name);
            let _ = fs::copy(path, &copy).map_err(BackendError::io(path))?;
        }
    }
    Ok(dest)
}

/// Write the platform definition of a packaged image.
pub(crate) fn write_platform_metadata(
    driver: &dyn BackendDriver,
    config: &InstanceConfig,
    target: &str,
    image: &ImageDescriptor,
    workspace: &Path,
) -> BackendResult<PathBuf> {
    let mut platform = Block::new("platform", Some(target));
    if let Some(base) = config.base_platform() {
        platform.set("base-platform", [base]);
    }
    for (key, value) in [
        ("vendor", &config.vendor),
        ("os", &config.os),
        ("arch", &config.arch),
    ] {
        if let Some(value) = value {
            platform.set(key, [value.as_str()]);
        }
    }
    if !config.features.is_empty() {
        platform.push_attribute(Attribute::new("features", config.features.iter()));
    }
    platform.set("build-time", [Utc::now().to_rfc3339().as_str()]);

    if let Some(keyfile) = config.keyfile.as_deref() {
        let source = Path::new(keyfile);
        if source.is_file() {
            let copy = workspace.join(format!("{target}.key"));
            let _ = fs::copy(source, &copy).map_err(BackendError::io(source))?;
            platform.set("keyfile", [copy.display().to_string()]);
        } else {
            platform.set("keyfile", [keyfile]);
        }
    }

    let mut backend = Block::new("backend", Some(driver.kind().name()));
    for (key, value) in driver.render_platform_information(image) {
        backend.set(&key, [value]);
    }
    platform.push_block(backend);

    let path = workspace.join(format!("{target}.platform"));
    let mut root = Block::new("root", None);
    root.push_block(platform);
    fs::write(&path, root.to_curly()).map_err(BackendError::io(&path))?;
    info!("Wrote platform definition {}", path.display());
    Ok(path)
}
