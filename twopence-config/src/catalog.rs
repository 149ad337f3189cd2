//! Catalog of every configuration object, merged across fragments.

use crate::error::ConfigResult;
use crate::model::{BackendSettings, Build, Node, Platform, Role, info_groups};
use crate::requirements::RequirementDef;
use crate::resource::ResourceSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use twopence_curly::{Block, Loader};

/// Name of the role every node falls back to
pub const DEFAULT_ROLE: &str = "default";

/// Where configuration fragments come from, lowest precedence first
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// System-wide config, skipped when absent
    pub global: Option<PathBuf>,
    /// Per-user config, skipped when absent
    pub user: Option<PathBuf>,
    /// Workspace fragments in BOM order; must exist
    pub fragments: Vec<PathBuf>,
    /// Extra include search paths
    pub search_paths: Vec<PathBuf>,
}

impl ConfigSources {
    /// `/etc/twopence/config.conf` and `<config dir>/twopence/config.conf`.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            global: Some(PathBuf::from("/etc/twopence/config.conf")),
            user: dirs::config_dir().map(|dir| dir.join("twopence").join("config.conf")),
            fragments: Vec::new(),
            search_paths: Vec::new(),
        }
    }

    /// Only the given fragments, no global or user config.
    #[must_use]
    pub fn fragments_only<I, P>(fragments: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Append workspace fragments.
    #[must_use]
    pub fn with_fragments<I, P>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.fragments.extend(fragments.into_iter().map(Into::into));
        self
    }
}

/// A document that contributed to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// File path
    pub path: PathBuf,
    /// SHA-256 of its content
    pub checksum: String,
}

/// Every object defined by the loaded fragments
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Test case name
    pub testcase: Option<String>,
    /// Workspace directory
    pub workspace: Option<String>,
    /// Global `parameters { ... }`
    pub parameters: BTreeMap<String, String>,
    /// Global `INFO_*` template data
    pub info: BTreeMap<String, Vec<String>>,
    /// Platforms and applications
    pub platforms: BTreeMap<String, Platform>,
    /// Builds
    pub builds: BTreeMap<String, Build>,
    /// Resource sets
    pub resources: BTreeMap<String, ResourceSet>,
    /// Roles, always including `default`
    pub roles: BTreeMap<String, Role>,
    /// Nodes
    pub nodes: BTreeMap<String, Node>,
    /// Requirement definitions
    pub requirements: BTreeMap<String, RequirementDef>,
    /// Saved backend settings
    pub backends: BTreeMap<String, BackendSettings>,
    /// Documents read, in load order
    pub sources: Vec<SourceRecord>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn absorb_into<T>(map: &mut BTreeMap<String, T>, name: &str, item: T, merge: fn(&mut T, T)) {
    match map.get_mut(name) {
        Some(existing) => merge(existing, item),
        None => {
            let _ = map.insert(name.to_string(), item);
        }
    }
}

impl Catalog {
    /// Empty catalog with the default role.
    #[must_use]
    pub fn new() -> Self {
        let mut roles = BTreeMap::new();
        let _ = roles.insert(DEFAULT_ROLE.to_string(), Role::new(DEFAULT_ROLE));
        Self {
            testcase: None,
            workspace: None,
            parameters: BTreeMap::new(),
            info: BTreeMap::new(),
            platforms: BTreeMap::new(),
            builds: BTreeMap::new(),
            resources: BTreeMap::new(),
            roles,
            nodes: BTreeMap::new(),
            requirements: BTreeMap::new(),
            backends: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    /// Load global, user and workspace configuration.
    ///
    /// # Errors
    ///
    /// Document errors, or malformed objects.
    pub fn load(sources: &ConfigSources) -> ConfigResult<Self> {
        let mut loader = Loader::new();
        loader.add_search_paths(sources.search_paths.iter().cloned());
        for path in sources.global.iter().chain(sources.user.iter()) {
            if let Some(dir) = path.parent() {
                loader.add_search_path(dir);
            }
        }

        let mut catalog = Self::new();
        for path in sources.global.iter().chain(sources.user.iter()) {
            if let Some(doc) = loader.load_optional(path)? {
                catalog.absorb(&doc.root)?;
                catalog.record(path, doc.checksum);
            }
        }
        for path in &sources.fragments {
            let doc = loader.load(path)?;
            catalog.absorb(&doc.root)?;
            catalog.record(path, doc.checksum);
        }

        info!(
            "Loaded {} platforms, {} builds, {} roles, {} nodes from {} files",
            catalog.platforms.len(),
            catalog.builds.len(),
            catalog.roles.len(),
            catalog.nodes.len(),
            catalog.sources.len()
        );
        Ok(catalog)
    }

    fn record(&mut self, path: &Path, checksum: String) {
        self.sources.push(SourceRecord {
            path: path.to_path_buf(),
            checksum,
        });
    }

    /// Merge the blocks of one document into the catalog.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed blocks.
    pub fn absorb(&mut self, root: &Block) -> ConfigResult<()> {
        if let Some(testcase) = root.get("testcase") {
            self.testcase = Some(testcase.to_string());
        }
        if let Some(workspace) = root.get("workspace") {
            self.workspace = Some(workspace.to_string());
        }

        for block in root.blocks() {
            let name = block.name_or_empty();
            match block.kind.as_str() {
                "platform" | "application" => {
                    absorb_into(&mut self.platforms, name, Platform::from_block(block)?, Platform::merge_from);
                }
                "build" => absorb_into(&mut self.builds, name, Build::from_block(block)?, Build::merge_from),
                "resources" => absorb_into(
                    &mut self.resources,
                    name,
                    ResourceSet::from_block(block)?,
                    ResourceSet::merge_from,
                ),
                "role" => absorb_into(&mut self.roles, name, Role::from_block(block), Role::merge_from),
                "node" => absorb_into(&mut self.nodes, name, Node::from_block(block), Node::merge_from),
                "requirement" => absorb_into(
                    &mut self.requirements,
                    name,
                    RequirementDef::from_block(block)?,
                    RequirementDef::merge_from,
                ),
                "backend" => absorb_into(
                    &mut self.backends,
                    name,
                    BackendSettings::from_block(block),
                    BackendSettings::merge_from,
                ),
                "parameters" => {
                    for attr in block.attributes() {
                        let _ = self
                            .parameters
                            .insert(attr.name.clone(), attr.values.join(" "));
                    }
                }
                "info" => {}
                other => debug!("Ignoring {other} block {name:?}"),
            }
        }

        self.info.extend(info_groups(root, "info_"));
        Ok(())
    }

    /// Look up a platform.
    #[must_use]
    pub fn platform(&self, name: &str) -> Option<&Platform> {
        self.platforms.get(name)
    }

    /// Look up a build.
    #[must_use]
    pub fn build(&self, name: &str) -> Option<&Build> {
        self.builds.get(name)
    }

    /// Look up a role.
    #[must_use]
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }
}
