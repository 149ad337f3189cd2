//! Typed configuration objects built from curly blocks.
//!
//! Every object can absorb a later definition of itself (`merge_from`):
//! scalars are overridden, lists are unioned, nested named blocks merge
//! by name.

use crate::error::{ConfigError, ConfigResult};
use crate::ordered::UniqueList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use twopence_curly::Block;

fn override_opt(target: &mut Option<String>, later: Option<String>) {
    if later.is_some() {
        *target = later;
    }
}

fn list(block: &Block, name: &str) -> UniqueList {
    block.values(name).into_iter().collect()
}

fn scalar(block: &Block, name: &str) -> Option<String> {
    block.get(name).map(str::to_string)
}

/// Merge `later` into `items` by name, appending unknown names.
fn merge_named<T, F>(items: &mut Vec<T>, later: Vec<T>, name: F, merge: fn(&mut T, T))
where
    F: Fn(&T) -> &str,
{
    for item in later {
        match items.iter_mut().find(|existing| name(&**existing) == name(&item)) {
            Some(existing) => merge(existing, item),
            None => items.push(item),
        }
    }
}

/// Package repository offered by a platform or build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository name, referenced by roles and nodes
    pub name: String,
    /// Base URL
    pub url: Option<String>,
    /// Signing key
    pub keyfile: Option<String>,
    /// Activated without being asked for
    pub enabled: Option<bool>,
}

impl Repository {
    /// Build from a `repository "<name>" { ... }` block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            name: block.name_or_empty().to_string(),
            url: scalar(block, "url"),
            keyfile: scalar(block, "keyfile"),
            enabled: block.flag("enabled"),
        }
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: Repository) {
        override_opt(&mut self.url, other.url);
        override_opt(&mut self.keyfile, other.keyfile);
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
    }
}

/// Backend-specific image reference of a platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Backend kind (`vagrant`, `podman`)
    pub backend: String,
    /// Image or box name
    pub image: Option<String>,
    /// Registry to pull from
    pub registry: Option<String>,
    /// Download URL
    pub url: Option<String>,
    /// Architecture
    pub arch: Option<String>,
}

impl ImageDescriptor {
    /// Build from a `backend "<kind>" { ... }` block nested in a platform.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            backend: block.name_or_empty().to_string(),
            image: scalar(block, "image"),
            registry: scalar(block, "registry"),
            url: scalar(block, "url"),
            arch: scalar(block, "arch"),
        }
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: ImageDescriptor) {
        override_opt(&mut self.image, other.image);
        override_opt(&mut self.registry, other.registry);
        override_opt(&mut self.url, other.url);
        override_opt(&mut self.arch, other.arch);
    }
}

/// When a stage is eligible to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageFilter {
    /// Every provisioning run
    Always,
    /// First successful provisioning of an instance only
    Once,
    /// Image builds only
    Build,
}

/// One unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Invocation {
    /// Literal shell command
    Command {
        /// Command line
        command: String,
    },
    /// Function defined in a shell library script
    Function {
        /// Script name in the shell library
        script: String,
        /// Function within the script
        function: String,
    },
}

/// Named, ordered group of invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name
    pub name: String,
    /// Reboot the instance once all invocations ran
    pub reboot: bool,
    /// Eligibility; unset means always
    pub only: Option<StageFilter>,
    /// Invocations in block order
    pub invocations: Vec<Invocation>,
}

impl Stage {
    /// Build from a `stage "<name>" { run ...; call script, function; }` block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed `call` or `only` values.
    pub fn from_block(block: &Block) -> ConfigResult<Self> {
        let name = block.name_or_empty().to_string();
        let mut stage = Stage {
            name: name.clone(),
            reboot: false,
            only: None,
            invocations: Vec::new(),
        };

        for attr in block.attributes() {
            match attr.name.as_str() {
                "run" => stage.invocations.extend(
                    attr.values
                        .iter()
                        .map(|command| Invocation::Command { command: command.clone() }),
                ),
                "call" => {
                    let [script, function] = attr.values.as_slice() else {
                        return Err(ConfigError::Invalid(format!(
                            "stage \"{name}\": call takes a script and a function name"
                        )));
                    };
                    stage.invocations.push(Invocation::Function {
                        script: script.clone(),
                        function: function.clone(),
                    });
                }
                "reboot" => {}
                "only" => {
                    stage.only = Some(match attr.values.first().map(String::as_str) {
                        Some("once") => StageFilter::Once,
                        Some("build") => StageFilter::Build,
                        Some("always") => StageFilter::Always,
                        other => {
                            return Err(ConfigError::Invalid(format!(
                                "stage \"{name}\": unknown filter {other:?}"
                            )));
                        }
                    });
                }
                other => debug!("stage {name}: ignoring attribute {other}"),
            }
        }
        stage.reboot = block.flag("reboot").unwrap_or(false);

        Ok(stage)
    }

    /// Effective filter.
    #[must_use]
    pub fn filter(&self) -> StageFilter {
        self.only.unwrap_or(StageFilter::Always)
    }

    /// Absorb a later stage of the same name.
    pub fn merge_from(&mut self, other: Stage) {
        self.invocations.extend(other.invocations);
        self.reboot |= other.reboot;
        if other.only.is_some() {
            self.only = other.only;
        }
    }
}

/// Merge stage lists: same names extend the earlier stage in place.
pub fn merge_stages(stages: &mut Vec<Stage>, later: Vec<Stage>) {
    merge_named(stages, later, |s| s.name.as_str(), Stage::merge_from);
}

fn stages_from(block: &Block) -> ConfigResult<Vec<Stage>> {
    let mut stages = Vec::new();
    for child in block.blocks_of("stage") {
        merge_stages(&mut stages, vec![Stage::from_block(child)?]);
    }
    Ok(stages)
}

fn repositories_from(block: &Block) -> Vec<Repository> {
    let mut repos = Vec::new();
    merge_named(
        &mut repos,
        block.blocks_of("repository").map(Repository::from_block).collect(),
        |r| r.name.as_str(),
        Repository::merge_from,
    );
    repos
}

fn info_from(block: &Block, prefix: &str, info: &mut BTreeMap<String, Vec<String>>) {
    for group in block.blocks_of("info") {
        for attr in group.attributes() {
            let key = format!("{prefix}{}_{}", group.name_or_empty(), attr.name)
                .to_uppercase()
                .replace('-', "_");
            let values = if attr.values.is_empty() {
                vec![String::new()]
            } else {
                attr.values.clone()
            };
            let _ = info.insert(key, values);
        }
    }
}

/// Extract `info "<group>" { key value; }` groups as `<PREFIX><GROUP>_<KEY>`.
#[must_use]
pub fn info_groups(block: &Block, prefix: &str) -> BTreeMap<String, Vec<String>> {
    let mut info = BTreeMap::new();
    info_from(block, prefix, &mut info);
    info
}

/// Operating system image definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Platform name
    pub name: String,
    /// OS vendor
    pub vendor: Option<String>,
    /// OS name and version
    pub os: Option<String>,
    /// Architecture
    pub arch: Option<String>,
    /// SSH key for the image
    pub keyfile: Option<String>,
    /// When the image was built, for platforms exported by `package`
    pub build_time: Option<String>,
    /// Set for `application` blocks
    pub application_class: Option<String>,
    /// Platforms inherited from, in declaration order
    pub base_platforms: UniqueList,
    /// Resource sets
    pub resources: UniqueList,
    /// Features provided
    pub features: UniqueList,
    /// Inherited features removed at this level
    pub non_features: UniqueList,
    /// Requirement names
    pub requires: UniqueList,
    /// Packages installed on every instance
    pub install: UniqueList,
    /// Services started on every instance
    pub start: UniqueList,
    /// Repositories offered
    pub repositories: Vec<Repository>,
    /// Provisioning stages
    pub stages: Vec<Stage>,
    /// Backend image references
    pub images: Vec<ImageDescriptor>,
    /// `PLATFORM_INFO_*` template data
    pub info: BTreeMap<String, Vec<String>>,
}

impl Platform {
    /// Build from a `platform` or `application` block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed stages.
    pub fn from_block(block: &Block) -> ConfigResult<Self> {
        let mut application_class = scalar(block, "application-class");
        if block.kind == "application" && application_class.is_none() {
            application_class = Some(block.name_or_empty().to_string());
        }

        Ok(Self {
            name: block.name_or_empty().to_string(),
            vendor: scalar(block, "vendor"),
            os: scalar(block, "os"),
            arch: scalar(block, "arch"),
            keyfile: scalar(block, "keyfile").or_else(|| scalar(block, "ssh-keyfile")),
            build_time: scalar(block, "build-time"),
            application_class,
            base_platforms: list(block, "use-base-platforms"),
            resources: list(block, "resources"),
            features: list(block, "features"),
            non_features: list(block, "non-features"),
            requires: list(block, "requires"),
            install: list(block, "install"),
            start: list(block, "start"),
            repositories: repositories_from(block),
            stages: stages_from(block)?,
            images: block.blocks_of("backend").map(ImageDescriptor::from_block).collect(),
            info: info_groups(block, "platform_info_"),
        })
    }

    /// Absorb a later definition of the same platform.
    pub fn merge_from(&mut self, other: Platform) {
        override_opt(&mut self.vendor, other.vendor);
        override_opt(&mut self.os, other.os);
        override_opt(&mut self.arch, other.arch);
        override_opt(&mut self.keyfile, other.keyfile);
        override_opt(&mut self.build_time, other.build_time);
        override_opt(&mut self.application_class, other.application_class);
        self.base_platforms.extend(other.base_platforms);
        self.resources.extend(other.resources);
        self.features.extend(other.features);
        self.non_features.extend(other.non_features);
        self.requires.extend(other.requires);
        self.install.extend(other.install);
        self.start.extend(other.start);
        merge_named(
            &mut self.repositories,
            other.repositories,
            |r| r.name.as_str(),
            Repository::merge_from,
        );
        merge_stages(&mut self.stages, other.stages);
        merge_named(
            &mut self.images,
            other.images,
            |i| i.backend.as_str(),
            ImageDescriptor::merge_from,
        );
        self.info.extend(other.info);
    }

    /// Image descriptor for a backend.
    #[must_use]
    pub fn image_for(&self, backend: &str) -> Option<&ImageDescriptor> {
        self.images.iter().find(|image| image.backend == backend)
    }
}

/// Feature overlay applied on top of a platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Build name
    pub name: String,
    /// Features the platform must already provide
    pub requires_features: UniqueList,
    /// Features the platform must not provide
    pub conflicts: UniqueList,
    /// Builds applied before this one
    pub base_builds: UniqueList,
    /// Features added
    pub features: UniqueList,
    /// Resource sets added
    pub resources: UniqueList,
    /// Requirement names
    pub requires: UniqueList,
    /// Packages installed
    pub install: UniqueList,
    /// Services started
    pub start: UniqueList,
    /// Repositories added and activated
    pub repositories: Vec<Repository>,
    /// Provisioning stages
    pub stages: Vec<Stage>,
}

impl Build {
    /// Build from a `build "<name>" { ... }` block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed stages.
    pub fn from_block(block: &Block) -> ConfigResult<Self> {
        let mut requires_features = UniqueList::new();
        let mut conflicts = UniqueList::new();
        for compat in block.blocks_of("compatibility") {
            requires_features.extend(compat.values("requires"));
            conflicts.extend(compat.values("conflicts"));
        }

        Ok(Self {
            name: block.name_or_empty().to_string(),
            requires_features,
            conflicts,
            base_builds: list(block, "use-base-builds"),
            features: list(block, "features"),
            resources: list(block, "resources"),
            requires: list(block, "requires"),
            install: list(block, "install"),
            start: list(block, "start"),
            repositories: repositories_from(block),
            stages: stages_from(block)?,
        })
    }

    /// Absorb a later definition of the same build.
    pub fn merge_from(&mut self, other: Build) {
        self.requires_features.extend(other.requires_features);
        self.conflicts.extend(other.conflicts);
        self.base_builds.extend(other.base_builds);
        self.features.extend(other.features);
        self.resources.extend(other.resources);
        self.requires.extend(other.requires);
        self.install.extend(other.install);
        self.start.extend(other.start);
        merge_named(
            &mut self.repositories,
            other.repositories,
            |r| r.name.as_str(),
            Repository::merge_from,
        );
        merge_stages(&mut self.stages, other.stages);
    }
}

/// Settings shared by roles and nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Platform reference, possibly compound (`leap-15.3-selinux`)
    pub platform: Option<String>,
    /// Build options
    pub builds: UniqueList,
    /// Repositories to activate
    pub repositories: UniqueList,
    /// Extra features
    pub features: UniqueList,
    /// Packages to install
    pub install: UniqueList,
    /// Services to start
    pub start: UniqueList,
    /// Requirement names
    pub requires: UniqueList,
}

impl Assignment {
    fn from_block(block: &Block) -> Self {
        Self {
            platform: scalar(block, "platform"),
            builds: list(block, "build"),
            repositories: list(block, "repositories"),
            features: list(block, "features"),
            install: list(block, "install"),
            start: list(block, "start"),
            requires: list(block, "requires"),
        }
    }

    fn merge_from(&mut self, other: Assignment) {
        override_opt(&mut self.platform, other.platform);
        self.builds.extend(other.builds);
        self.repositories.extend(other.repositories);
        self.features.extend(other.features);
        self.install.extend(other.install);
        self.start.extend(other.start);
        self.requires.extend(other.requires);
    }
}

/// Reusable node template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Settings
    pub settings: Assignment,
}

impl Role {
    /// Empty role.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            settings: Assignment::default(),
        }
    }

    /// Build from a `role "<name>" { ... }` block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            name: block.name_or_empty().to_string(),
            settings: Assignment::from_block(block),
        }
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: Role) {
        self.settings.merge_from(other.settings);
    }
}

/// One instance of the topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name
    pub name: String,
    /// Explicit role
    pub role: Option<String>,
    /// Node-level settings, overriding the role
    pub settings: Assignment,
}

impl Node {
    /// Build from a `node "<name>" { ... }` block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            name: block.name_or_empty().to_string(),
            role: scalar(block, "role"),
            settings: Assignment::from_block(block),
        }
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: Node) {
        override_opt(&mut self.role, other.role);
        self.settings.merge_from(other.settings);
    }
}

/// Saved `backend "<kind>" { ... }` settings, interpreted by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    /// Backend kind
    pub name: String,
    /// Raw settings; later occurrences of an attribute win
    pub block: Block,
}

impl BackendSettings {
    /// Wrap a top-level backend block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self {
            name: block.name_or_empty().to_string(),
            block: block.clone(),
        }
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: BackendSettings) {
        self.block.items.extend(other.block.items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twopence_curly::parse_str;

    fn first(source: &str) -> Block {
        parse_str(source).unwrap().blocks().next().unwrap().clone()
    }

    #[test]
    fn test_platform_from_block() {
        let platform = Platform::from_block(&first(
            r#"
platform leap-15.3 {
    vendor suse;
    os leap-15.3;
    ssh-keyfile /keys/leap;
    use-base-platforms suse-base;
    features systemd, zypper;
    repository oss { url http://example.com/oss; enabled; }
    backend podman { image leap:15.3; registry registry.opensuse.org; }
    info registration { email "qa@example.com"; }
    stage prep { run "zypper ref"; }
}
"#,
        ))
        .unwrap();

        assert_eq!(platform.keyfile.as_deref(), Some("/keys/leap"));
        assert_eq!(platform.features.as_slice(), ["systemd", "zypper"]);
        assert_eq!(platform.repositories[0].enabled, Some(true));
        assert_eq!(
            platform.image_for("podman").and_then(|i| i.image.as_deref()),
            Some("leap:15.3")
        );
        assert_eq!(
            platform.info.get("PLATFORM_INFO_REGISTRATION_EMAIL"),
            Some(&vec!["qa@example.com".to_string()])
        );
        assert_eq!(platform.stages[0].name, "prep");
    }

    #[test]
    fn test_application_block() {
        let platform = Platform::from_block(&first("application nginx { vendor suse; }")).unwrap();
        assert_eq!(platform.application_class.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_stage_invocations_keep_order() {
        let stage = Stage::from_block(&first(
            r#"stage build { run "a"; call selinux, enable; run "b", "c"; reboot; only build; }"#,
        ))
        .unwrap();

        assert!(stage.reboot);
        assert_eq!(stage.filter(), StageFilter::Build);
        assert_eq!(
            stage.invocations,
            vec![
                Invocation::Command { command: "a".into() },
                Invocation::Function {
                    script: "selinux".into(),
                    function: "enable".into()
                },
                Invocation::Command { command: "b".into() },
                Invocation::Command { command: "c".into() },
            ]
        );
    }

    #[test]
    fn test_stage_rejects_bad_call() {
        let result = Stage::from_block(&first("stage x { call onlyscript; }"));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        let result = Stage::from_block(&first("stage x { only sometimes; }"));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_platform_merge() {
        let mut early = Platform::from_block(&first(
            "platform p { os one; features a; stage prep { run x; } }",
        ))
        .unwrap();
        let later = Platform::from_block(&first(
            "platform p { os two; features b, a; stage prep { run y; reboot; } stage post { run z; } }",
        ))
        .unwrap();
        early.merge_from(later);

        assert_eq!(early.os.as_deref(), Some("two"));
        assert_eq!(early.features.as_slice(), ["a", "b"]);
        assert_eq!(early.stages.len(), 2);
        assert_eq!(early.stages[0].invocations.len(), 2);
        assert!(early.stages[0].reboot);
    }

    #[test]
    fn test_build_compatibility() {
        let build = Build::from_block(&first(
            "build selinux { compatibility { requires systemd; conflicts apparmor; } features selinux; use-base-builds sle15-selinux; }",
        ))
        .unwrap();

        assert_eq!(build.requires_features.as_slice(), ["systemd"]);
        assert_eq!(build.conflicts.as_slice(), ["apparmor"]);
        assert_eq!(build.base_builds.as_slice(), ["sle15-selinux"]);
    }

    #[test]
    fn test_node_merge_overrides_role() {
        let mut node = Node::from_block(&first("node client { role default; install a; }"));
        node.merge_from(Node::from_block(&first("node client { role client; install b; }")));

        assert_eq!(node.role.as_deref(), Some("client"));
        assert_eq!(node.settings.install.as_slice(), ["a", "b"]);
    }
}
