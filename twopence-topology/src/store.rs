//! Workspace persistence: the BOM and the status file.
//!
//! ```text
//! <workspace>/
//! ├── bom.json      # backend and configuration fragments
//! ├── status.json   # per-instance lifecycle state
//! ├── .lock         # held while a command works on the topology
//! ├── <node>/       # backend files of one instance
//! └── run/          # log space
//! ```

use crate::backend::BackendKind;
use crate::error::{TopologyError, TopologyResult};
use crate::state::{Checkpoint, InstanceState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use twopence_config::InstanceConfig;

/// Write a file so readers see either the old or the new content.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> TopologyResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(TopologyError::io(parent))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&temp_path)
        .map_err(TopologyError::io(&temp_path))?;
    file.write_all(data).map_err(TopologyError::io(&temp_path))?;
    file.sync_all().map_err(TopologyError::io(&temp_path))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(TopologyError::io(path))?;

    // Make the new directory entry durable; not every file system supports it
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> TopologyResult<T> {
    let data = fs::read(path).map_err(TopologyError::io(path))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Exclusive lock on a workspace, released on drop
#[derive(Debug)]
pub struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn acquire_lock(path: &Path) -> TopologyResult<WorkspaceLock> {
    use nix::errno::Errno;
    use nix::fcntl::{FlockArg, flock};
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(TopologyError::io(parent))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(TopologyError::io(path))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => {}
        Err(Errno::EWOULDBLOCK) => {
            return Err(TopologyError::WorkspaceBusy(
                path.parent().unwrap_or(path).to_path_buf(),
            ));
        }
        Err(errno) => return Err(TopologyError::io(path)(errno.into())),
    }

    debug!("Locked {}", path.display());
    Ok(WorkspaceLock {
        _file: file,
        path: path.to_path_buf(),
    })
}

/// Directory holding one topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Workspace rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `bom.json`
    #[must_use]
    pub fn bom_path(&self) -> PathBuf {
        self.root.join("bom.json")
    }

    /// `status.json`
    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Per-instance backend directory.
    #[must_use]
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Log space.
    #[must_use]
    pub fn logspace(&self) -> PathBuf {
        self.root.join("run")
    }

    /// Take the workspace lock.
    ///
    /// # Errors
    ///
    /// `WorkspaceBusy` if another command holds it.
    pub fn lock(&self) -> TopologyResult<WorkspaceLock> {
        acquire_lock(&self.root.join(".lock"))
    }

    /// Load the status file, or start an empty one.
    ///
    /// # Errors
    ///
    /// Unreadable or corrupt status file.
    pub fn load_status(&self, backend: BackendKind) -> TopologyResult<TopologyStatus> {
        let path = self.status_path();
        if path.exists() {
            read_json(&path)
        } else {
            Ok(TopologyStatus::new(backend, self.logspace()))
        }
    }

    /// Persist the status file atomically.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn save_status(&self, status: &TopologyStatus) -> TopologyResult<()> {
        atomic_write(&self.status_path(), &serde_json::to_vec_pretty(status)?)
    }

    /// Remove the status file and the BOM.
    ///
    /// # Errors
    ///
    /// I/O failures other than the files being absent.
    pub fn zap(&self) -> TopologyResult<()> {
        for path in [self.status_path(), self.bom_path()] {
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(TopologyError::io(&path)(err)),
            }
        }
        Ok(())
    }
}

/// Bill of materials of a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bom {
    /// Backend the topology runs on
    pub backend: BackendKind,
    /// Test case name
    pub testcase: Option<String>,
    /// Configuration fragments, in load order
    pub configs: Vec<PathBuf>,
    /// Log space
    pub logspace: PathBuf,
    /// Status file
    pub status: PathBuf,
}

impl Bom {
    /// Create the BOM of a fresh workspace.
    ///
    /// # Errors
    ///
    /// `BomExists` if the workspace is already initialised.
    pub fn init(
        workspace: &Workspace,
        backend: BackendKind,
        testcase: Option<String>,
        configs: Vec<PathBuf>,
    ) -> TopologyResult<Self> {
        let path = workspace.bom_path();
        if path.exists() {
            return Err(TopologyError::BomExists(workspace.root().to_path_buf()));
        }

        let logspace = workspace.logspace();
        fs::create_dir_all(&logspace).map_err(TopologyError::io(&logspace))?;

        let bom = Self {
            backend,
            testcase,
            configs,
            logspace,
            status: workspace.status_path(),
        };
        atomic_write(&path, &serde_json::to_vec_pretty(&bom)?)?;
        info!("Initialized {backend} workspace {}", workspace.root().display());
        Ok(bom)
    }

    /// Load the BOM of an initialised workspace.
    ///
    /// # Errors
    ///
    /// `BomMissing` if the workspace was never initialised.
    pub fn load(workspace: &Workspace) -> TopologyResult<Self> {
        let path = workspace.bom_path();
        if !path.exists() {
            return Err(TopologyError::BomMissing(workspace.root().to_path_buf()));
        }
        read_json(&path)
    }
}

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

/// Address of an instance network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Address family
    pub family: AddressFamily,
    /// Address without prefix
    pub address: String,
    /// Prefix length
    pub prefix_len: u8,
}

impl NetworkInterface {
    /// Parse an address, deriving the family and the default prefix (24 or 64).
    #[must_use]
    pub fn from_address(address: &str, prefix_len: Option<u8>) -> Self {
        let family = if address.contains(':') {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        };
        let prefix_len = prefix_len.unwrap_or(match family {
            AddressFamily::Ipv4 => 24,
            AddressFamily::Ipv6 => 64,
        });
        Self {
            family,
            address: address.to_string(),
            prefix_len,
        }
    }
}

/// Persisted state of one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node name
    pub name: String,
    /// Role
    pub role: Option<String>,
    /// Platform reference
    pub platform: Option<String>,
    /// Lifecycle state
    pub state: InstanceState,
    /// Backend bookkeeping (instance dir, container name, pid, ...)
    pub handle: BTreeMap<String, String>,
    /// Network addresses
    pub interfaces: Vec<NetworkInterface>,
    /// Effective features
    pub features: Vec<String>,
    /// OS vendor
    pub vendor: Option<String>,
    /// OS name
    pub os: Option<String>,
    /// Last boot
    pub start_time: Option<DateTime<Utc>>,
    /// Test target, `tcp:<address>:4000`
    pub target: Option<String>,
    /// Pending reboot
    pub checkpoint: Option<Checkpoint>,
    /// `only once` stages that completed
    pub once_done: BTreeSet<String>,
    /// Digest of the config the instance was created from
    pub config_digest: Option<String>,
    /// Provisioned for an image build
    pub built: bool,
}

impl NodeStatus {
    /// Fresh record for a node about to be created.
    ///
    /// # Errors
    ///
    /// Serializing the config for its digest.
    pub fn for_config(config: &InstanceConfig, image_build: bool) -> TopologyResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            role: config.role.clone(),
            platform: config.platform.clone(),
            state: InstanceState::Absent,
            features: config.features.iter().cloned().collect(),
            vendor: config.vendor.clone(),
            os: config.os.clone(),
            config_digest: Some(config.digest()?),
            built: image_build,
            ..Self::default()
        })
    }

    /// Record that knows nothing but the name.
    #[must_use]
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Handle entry.
    #[must_use]
    pub fn handle(&self, key: &str) -> Option<&str> {
        self.handle.get(key).map(String::as_str)
    }

    /// First IPv4 address, else the first address.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|i| i.family == AddressFamily::Ipv4)
            .or_else(|| self.interfaces.first())
            .map(|i| i.address.as_str())
    }
}

/// Persisted state of a whole topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyStatus {
    /// Backend
    pub backend: BackendKind,
    /// Test case name
    pub testcase: Option<String>,
    /// Log space
    pub logspace: PathBuf,
    /// Global parameters
    pub parameters: BTreeMap<String, String>,
    /// Instances by node name
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl TopologyStatus {
    /// Empty status.
    #[must_use]
    pub fn new(backend: BackendKind, logspace: PathBuf) -> Self {
        Self {
            backend,
            testcase: None,
            logspace,
            parameters: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.get(name)
    }

    /// Names of nodes in `state`.
    #[must_use]
    pub fn nodes_in(&self, state: InstanceState) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.state == state)
            .map(|node| node.name.clone())
            .collect()
    }

    /// Names of nodes with backend resources.
    #[must_use]
    pub fn existing(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.state.exists())
            .map(|node| node.name.clone())
            .collect()
    }
    /// Whether an instance waiting at a checkpoint is being provisioned
    /// for an image build.
    #[must_use]
    pub fn resumes_image_build(&self) -> bool {
        self.nodes
            .values()
            .any(|node| node.built && node.checkpoint.is_some())
    }
}
