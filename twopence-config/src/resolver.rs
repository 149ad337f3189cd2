//! Compiles the catalog into one immutable [`InstanceConfig`] per node.
//!
//! Resolution of a node:
//! 1. Pick the role (explicit, same-named, or `default`)
//! 2. Resolve the platform reference, possibly compound (`leap-15.3-selinux`)
//! 3. Linearize the platform chain and fold it, bases first
//! 4. Linearize the selected builds and apply them in order
//! 5. Check build compatibility against the resulting feature set
//! 6. Merge default role, role and node settings; activate repositories
//! 7. Validate for the purpose the configuration is compiled for

use crate::catalog::{Catalog, DEFAULT_ROLE};
use crate::error::{ConfigError, ConfigResult, Constraint};
use crate::model::{Assignment, Build, ImageDescriptor, Node, Platform, Repository, Role, Stage, merge_stages};
use crate::ordered::UniqueList;
use crate::requirements::{AnswerSet, Answers};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};
use twopence_graph::InheritanceGraph;

/// What the configuration is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Workspace initialisation
    Init,
    /// Provisioning a test topology
    Testing,
    /// Building a new image
    Build,
    /// Reporting state
    Status,
    /// Logging into an instance
    Login,
    /// Tearing down
    Destroy,
}

impl Purpose {
    /// Strict purposes need every reference to resolve.
    #[must_use]
    pub fn is_strict(self) -> bool {
        matches!(self, Purpose::Init | Purpose::Testing | Purpose::Build)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Purpose::Init => "init",
            Purpose::Testing => "testing",
            Purpose::Build => "build",
            Purpose::Status => "status",
            Purpose::Login => "login",
            Purpose::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Fully resolved, backend-agnostic configuration of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Node name
    pub name: String,
    /// Role the node was resolved with
    pub role: Option<String>,
    /// Platform reference as configured
    pub platform: Option<String>,
    /// Platform chain, most distant ancestor first
    pub platform_chain: Vec<String>,
    /// OS vendor
    pub vendor: Option<String>,
    /// OS name and version
    pub os: Option<String>,
    /// Architecture
    pub arch: Option<String>,
    /// SSH key
    pub keyfile: Option<String>,
    /// Application class for application platforms
    pub application_class: Option<String>,
    /// Builds in application order
    pub builds: Vec<String>,
    /// Effective features
    pub features: UniqueList,
    /// Resource sets
    pub resources: UniqueList,
    /// Packages to install
    pub install: UniqueList,
    /// Services to start
    pub start: UniqueList,
    /// Activated repositories
    pub repositories: Vec<Repository>,
    /// Merged stages, platform chain first, then builds
    pub stages: Vec<Stage>,
    /// Backend image references
    pub images: Vec<ImageDescriptor>,
    /// Template data (`INFO_*`, `PLATFORM_INFO_*`)
    pub info: BTreeMap<String, Vec<String>>,
    /// Requirement answers; `None` marks an unresolved requirement
    pub requirements: BTreeMap<String, Option<Answers>>,
    /// Compiled for an image build
    pub image_build: bool,
    /// Produced by lenient resolution after a failure; name only
    pub skeleton: bool,
}

impl InstanceConfig {
    /// Name-only config used when lenient resolution fails.
    #[must_use]
    pub fn skeleton(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: None,
            platform: None,
            platform_chain: Vec::new(),
            vendor: None,
            os: None,
            arch: None,
            keyfile: None,
            application_class: None,
            builds: Vec::new(),
            features: UniqueList::new(),
            resources: UniqueList::new(),
            install: UniqueList::new(),
            start: UniqueList::new(),
            repositories: Vec::new(),
            stages: Vec::new(),
            images: Vec::new(),
            info: BTreeMap::new(),
            requirements: BTreeMap::new(),
            image_build: false,
            skeleton: true,
        }
    }

    /// Image descriptor for a backend.
    #[must_use]
    pub fn image_for(&self, backend: &str) -> Option<&ImageDescriptor> {
        self.images.iter().find(|image| image.backend == backend)
    }

    /// Leaf platform of the chain.
    #[must_use]
    pub fn base_platform(&self) -> Option<&str> {
        self.platform_chain.last().map(String::as_str)
    }

    /// SHA-256 of the canonical JSON form.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn digest(&self) -> ConfigResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// Every node of a topology, resolved for one purpose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledConfig {
    /// Purpose compiled for
    pub purpose: Purpose,
    /// Test case name
    pub testcase: Option<String>,
    /// Global parameters
    pub parameters: BTreeMap<String, String>,
    /// Instance configs sorted by node name
    pub nodes: Vec<InstanceConfig>,
}

impl CompiledConfig {
    /// Look up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&InstanceConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Unresolved requirement markers as (requirement, node) pairs.
    #[must_use]
    pub fn unresolved(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.requirements
                    .iter()
                    .filter(|(_, answers)| answers.is_none())
                    .map(|(name, _)| (name.clone(), node.name.clone()))
            })
            .collect()
    }

    /// Pretty JSON; identical inputs give identical bytes.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 of the canonical JSON form.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn digest(&self) -> ConfigResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// Resolves nodes against a catalog
#[derive(Debug)]
pub struct Resolver<'a> {
    catalog: &'a Catalog,
    platforms: InheritanceGraph,
    builds: InheritanceGraph,
    // Objects whose base declarations failed, with the reason
    broken: BTreeMap<(&'static str, String), ConfigError>,
}

impl<'a> Resolver<'a> {
    /// Build the platform and build inheritance graphs.
    ///
    /// Broken declarations (unknown bases, cycles) are recorded and reported
    /// when a node actually depends on them.
    #[must_use]
    pub fn new(catalog: &'a Catalog) -> Self {
        let mut broken = BTreeMap::new();

        let mut platforms = InheritanceGraph::new();
        for name in catalog.platforms.keys() {
            let _ = platforms.add_node(name);
        }
        for (name, platform) in &catalog.platforms {
            for base in &platform.base_platforms {
                if let Err(err) = platforms.add_base(name, base) {
                    let _ = broken.insert(("platform", name.clone()), ConfigError::from_graph("platform", err));
                }
            }
        }

        let mut builds = InheritanceGraph::new();
        for name in catalog.builds.keys() {
            let _ = builds.add_node(name);
        }
        for (name, build) in &catalog.builds {
            for base in &build.base_builds {
                if let Err(err) = builds.add_base(name, base) {
                    let _ = broken.insert(("build", name.clone()), ConfigError::from_graph("build", err));
                }
            }
        }

        Self {
            catalog,
            platforms,
            builds,
            broken,
        }
    }

    /// Check the whole catalog, including objects no node uses.
    ///
    /// # Errors
    ///
    /// The first broken inheritance declaration.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(err) = self.broken.values().next() {
            return Err(clone_error(err));
        }
        let _ = self
            .platforms
            .topological_sort()
            .map_err(|err| ConfigError::from_graph("platform", err))?;
        let _ = self
            .builds
            .topological_sort()
            .map_err(|err| ConfigError::from_graph("build", err))?;
        Ok(())
    }

    /// Compile every node for `purpose`.
    ///
    /// Requirement answers missing from `answers` become markers rather
    /// than errors; see [`CompiledConfig::unresolved`].
    ///
    /// # Errors
    ///
    /// For strict purposes, any resolution failure of any node.
    pub fn compile(&self, purpose: Purpose, answers: &AnswerSet) -> ConfigResult<CompiledConfig> {
        if self.catalog.nodes.is_empty() && purpose.is_strict() {
            return Err(ConfigError::Invalid("no nodes configured".to_string()));
        }

        let mut nodes = Vec::with_capacity(self.catalog.nodes.len());
        for node in self.catalog.nodes.values() {
            match self.resolve_node(node, purpose, answers) {
                Ok(config) => nodes.push(config),
                Err(err) if !purpose.is_strict() => {
                    warn!("Node {}: {err}; continuing without its configuration", node.name);
                    nodes.push(InstanceConfig::skeleton(&node.name));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(CompiledConfig {
            purpose,
            testcase: self.catalog.testcase.clone(),
            parameters: self.catalog.parameters.clone(),
            nodes,
        })
    }

    /// Split a platform reference into a platform and the builds it names.
    ///
    /// `leap-15.3-selinux` resolves to platform `leap-15.3` with build
    /// `selinux` when no platform of that full name exists.
    ///
    /// # Errors
    ///
    /// `UnknownReference` when no split matches defined names.
    pub fn resolve_platform_reference(&self, reference: &str) -> ConfigResult<(String, Vec<String>)> {
        if self.catalog.platforms.contains_key(reference) {
            return Ok((reference.to_string(), Vec::new()));
        }

        let unknown = || ConfigError::UnknownReference {
            kind: "platform",
            name: reference.to_string(),
            context: None,
        };

        let platform = self
            .catalog
            .platforms
            .keys()
            .filter(|name| {
                reference.len() > name.len()
                    && reference.starts_with(name.as_str())
                    && reference[name.len()..].starts_with('-')
            })
            .max_by_key(|name| name.len())
            .ok_or_else(unknown)?;

        let mut rest = &reference[platform.len() + 1..];
        let mut builds = Vec::new();
        while !rest.is_empty() {
            let build = self
                .catalog
                .builds
                .keys()
                .filter(|name| {
                    rest == name.as_str()
                        || (rest.starts_with(name.as_str()) && rest[name.len()..].starts_with('-'))
                })
                .max_by_key(|name| name.len())
                .ok_or_else(unknown)?;
            builds.push(build.clone());
            rest = rest[build.len()..].trim_start_matches('-');
        }

        debug!("Platform {reference} resolves to {platform} with builds {builds:?}");
        Ok((platform.clone(), builds))
    }

    fn check_broken<'n, I>(&self, kind: &'static str, names: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = &'n String>,
    {
        for name in names {
            if let Some(err) = self.broken.get(&(kind, name.clone())) {
                return Err(clone_error(err));
            }
        }
        Ok(())
    }

    fn role_for(&self, node: &Node) -> ConfigResult<&'a Role> {
        let roles = &self.catalog.roles;
        let name = match &node.role {
            Some(role) => role.as_str(),
            None if roles.contains_key(&node.name) => node.name.as_str(),
            None => DEFAULT_ROLE,
        };
        roles.get(name).ok_or_else(|| ConfigError::UnknownReference {
            kind: "role",
            name: name.to_string(),
            context: Some(format!("node {}", node.name)),
        })
    }

    /// Resolve one node.
    ///
    /// # Errors
    ///
    /// Unknown references, inheritance cycles, incompatible builds, and for
    /// strict purposes a platform without vendor or os.
    pub fn resolve_node(
        &self,
        node: &Node,
        purpose: Purpose,
        answers: &AnswerSet,
    ) -> ConfigResult<InstanceConfig> {
        let default = self.catalog.role(DEFAULT_ROLE);
        let role = self.role_for(node)?;
        let layers: Vec<&Assignment> = default
            .into_iter()
            .filter(|d| d.name != role.name)
            .map(|d| &d.settings)
            .chain([&role.settings, &node.settings])
            .collect();

        let reference = layers
            .iter()
            .rev()
            .find_map(|layer| layer.platform.clone())
            .ok_or_else(|| ConfigError::MissingAttribute {
                kind: "node",
                name: node.name.clone(),
                attribute: "platform",
            })?;

        let (leaf, compound_builds) = self.resolve_platform_reference(&reference)?;
        let chain = self
            .platforms
            .linearize(&leaf)
            .map_err(|err| ConfigError::from_graph("platform", err))?;
        self.check_broken("platform", &chain)?;

        let mut config = InstanceConfig::skeleton(&node.name);
        config.skeleton = false;
        config.role = Some(role.name.clone());
        config.platform = Some(reference.clone());
        config.image_build = purpose == Purpose::Build;
        config.info = self.catalog.info.clone();

        let mut available: Vec<Repository> = Vec::new();
        for name in &chain {
            let Some(platform) = self.catalog.platform(name) else {
                continue;
            };
            apply_platform(&mut config, &mut available, platform);
        }
        config.platform_chain = chain;

        for layer in &layers {
            config.features.extend(layer.features.iter().cloned());
        }

        let mut selected = UniqueList::new();
        selected.extend(compound_builds);
        for layer in &layers {
            selected.extend(layer.builds.iter().cloned());
        }
        for name in &selected {
            if !self.catalog.builds.contains_key(name) {
                return Err(ConfigError::UnknownReference {
                    kind: "build",
                    name: name.clone(),
                    context: Some(format!("node {}", node.name)),
                });
            }
        }
        let order = self
            .builds
            .linearize_many(selected.iter().map(String::as_str))
            .map_err(|err| ConfigError::from_graph("build", err))?;
        self.check_broken("build", &order)?;

        let applied: Vec<&Build> = order.iter().filter_map(|name| self.catalog.build(name)).collect();
        for build in &applied {
            apply_build(&mut config, &mut available, build);
        }
        check_compatibility(&config.features, &applied)?;
        config.builds = order;

        activate_repositories(&mut config, &available, &layers)?;
        self.expand_resources(&mut config, &layers)?;

        let mut requires = UniqueList::new();
        for name in &config.platform_chain {
            if let Some(platform) = self.catalog.platform(name) {
                requires.extend(platform.requires.iter().cloned());
            }
        }
        for build in &applied {
            requires.extend(build.requires.iter().cloned());
        }
        for layer in &layers {
            requires.extend(layer.requires.iter().cloned());
        }
        for name in requires {
            if purpose.is_strict() && !self.catalog.requirements.contains_key(&name) {
                return Err(ConfigError::UnknownReference {
                    kind: "requirement",
                    name,
                    context: Some(format!("node {}", node.name)),
                });
            }
            let answer = answers.get(&name, &node.name).cloned();
            let _ = config.requirements.insert(name, answer);
        }

        if purpose.is_strict() {
            for (attribute, value) in [("vendor", &config.vendor), ("os", &config.os)] {
                if value.is_none() {
                    return Err(ConfigError::MissingAttribute {
                        kind: "platform",
                        name: leaf.clone(),
                        attribute,
                    });
                }
            }
        }

        debug!(
            "Resolved node {}: platform {}, builds {:?}, features {:?}",
            config.name,
            reference,
            config.builds,
            config.features.as_slice()
        );
        Ok(config)
    }

    fn expand_resources(
        &self,
        config: &mut InstanceConfig,
        layers: &[&Assignment],
    ) -> ConfigResult<()> {
        let mut sets = Vec::new();
        for name in &config.resources {
            let set = self.catalog.resources.get(name).ok_or_else(|| ConfigError::UnknownReference {
                kind: "resource set",
                name: name.clone(),
                context: Some(format!("node {}", config.name)),
            })?;
            sets.push(set);
        }

        let mut install = std::mem::take(&mut config.install);
        let mut start = std::mem::take(&mut config.start);
        for layer in layers {
            install.extend(layer.install.iter().cloned());
            start.extend(layer.start.iter().cloned());
        }

        for entry in install {
            match sets.iter().find_map(|set| set.packages_for(&entry)) {
                Some(packages) => config.install.extend(packages),
                None => {
                    let _ = config.install.push(entry);
                }
            }
        }
        for entry in start {
            let unit = sets
                .iter()
                .find_map(|set| set.service_unit(&entry))
                .unwrap_or(entry);
            let _ = config.start.push(unit);
        }
        Ok(())
    }
}

fn activate_repositories(
    config: &mut InstanceConfig,
    available: &[Repository],
    layers: &[&Assignment],
) -> ConfigResult<()> {
    for layer in layers {
        for name in &layer.repositories {
            let Some(repo) = available.iter().find(|repo| &repo.name == name) else {
                return Err(ConfigError::UnknownReference {
                    kind: "repository",
                    name: name.clone(),
                    context: Some(format!(
                        "node {} on platform {}",
                        config.name,
                        config.base_platform().unwrap_or("?")
                    )),
                });
            };
            if !config.repositories.iter().any(|r| r.name == repo.name) {
                config.repositories.push(repo.clone());
            }
        }
    }
    Ok(())
}

fn apply_platform(config: &mut InstanceConfig, available: &mut Vec<Repository>, platform: &Platform) {
    let scalars = [
        (&mut config.vendor, &platform.vendor),
        (&mut config.os, &platform.os),
        (&mut config.arch, &platform.arch),
        (&mut config.keyfile, &platform.keyfile),
        (&mut config.application_class, &platform.application_class),
    ];
    for (target, value) in scalars {
        if value.is_some() {
            target.clone_from(value);
        }
    }

    // Non-features only strip what ancestors contributed
    for feature in &platform.non_features {
        let _ = config.features.remove(feature);
    }
    config.features.extend(platform.features.iter().cloned());

    config.resources.extend(platform.resources.iter().cloned());
    config.install.extend(platform.install.iter().cloned());
    config.start.extend(platform.start.iter().cloned());
    merge_stages(&mut config.stages, platform.stages.clone());
    for image in &platform.images {
        match config.images.iter_mut().find(|i| i.backend == image.backend) {
            Some(existing) => existing.merge_from(image.clone()),
            None => config.images.push(image.clone()),
        }
    }
    config.info.extend(platform.info.clone());

    for repo in &platform.repositories {
        match available.iter_mut().find(|r| r.name == repo.name) {
            Some(existing) => existing.merge_from(repo.clone()),
            None => available.push(repo.clone()),
        }
    }
    for repo in available.iter().filter(|r| r.enabled == Some(true)) {
        if !config.repositories.iter().any(|r| r.name == repo.name) {
            config.repositories.push(repo.clone());
        }
    }
}

fn apply_build(config: &mut InstanceConfig, available: &mut Vec<Repository>, build: &Build) {
    config.features.extend(build.features.iter().cloned());
    config.resources.extend(build.resources.iter().cloned());
    config.install.extend(build.install.iter().cloned());
    config.start.extend(build.start.iter().cloned());
    merge_stages(&mut config.stages, build.stages.clone());

    for repo in &build.repositories {
        available.push(repo.clone());
        if !config.repositories.iter().any(|r| r.name == repo.name) {
            config.repositories.push(repo.clone());
        }
    }
}

/// Every build must find its required features, and none of its
/// conflicting ones, among the features contributed by everything else.
fn check_compatibility(features: &UniqueList, applied: &[&Build]) -> ConfigResult<()> {
    for build in applied {
        let provided_elsewhere = |feature: &str| {
            !build.features.contains(feature)
                || applied
                    .iter()
                    .any(|other| other.name != build.name && other.features.contains(feature))
        };
        let others: Vec<&String> = features
            .iter()
            .filter(|f| provided_elsewhere(f.as_str()))
            .collect();

        if let Some(feature) = build
            .requires_features
            .iter()
            .find(|feature| !others.contains(feature))
        {
            return Err(ConfigError::Incompatible {
                build: build.name.clone(),
                feature: feature.clone(),
                constraint: Constraint::Requires,
            });
        }
        if let Some(feature) = build
            .conflicts
            .iter()
            .find(|feature| others.contains(feature))
        {
            return Err(ConfigError::Incompatible {
                build: build.name.clone(),
                feature: feature.clone(),
                constraint: Constraint::Conflicts,
            });
        }
    }
    Ok(())
}

// Recorded graph errors are handed out once per node that hits them
fn clone_error(err: &ConfigError) -> ConfigError {
    match err {
        ConfigError::InheritanceCycle { kind, chain } => ConfigError::InheritanceCycle {
            kind,
            chain: chain.clone(),
        },
        ConfigError::UnknownReference { kind, name, context } => ConfigError::UnknownReference {
            kind,
            name: name.clone(),
            context: context.clone(),
        },
        other => ConfigError::Invalid(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use twopence_curly::parse_str;

    fn catalog(source: &str) -> Catalog {
        let mut catalog = Catalog::new();
        catalog.absorb(&parse_str(source).unwrap()).unwrap();
        catalog
    }

    const BASE: &str = r#"
platform suse { vendor suse; features systemd, zypper, ipv4; repository oss { url http://oss; } }
platform leap-15.3 { use-base-platforms suse; os leap-15.3; non-features ipv4; }
build fips { features fips; compatibility { conflicts selinux; } }
build selinux { features selinux; compatibility { requires systemd; } }
"#;

    #[test]
    fn test_non_features_strip_ancestors() {
        let catalog = catalog(&format!("{BASE} node n {{ platform leap-15.3; }}"));
        let compiled = Resolver::new(&catalog)
            .compile(Purpose::Testing, &AnswerSet::new())
            .unwrap();

        let node = compiled.node("n").unwrap();
        assert_eq!(node.features.as_slice(), ["systemd", "zypper"]);
        assert_eq!(node.platform_chain, vec!["suse", "leap-15.3"]);
        assert_eq!(node.vendor.as_deref(), Some("suse"));
    }

    #[test]
    fn test_compound_reference() {
        let catalog = catalog(BASE);
        let resolver = Resolver::new(&catalog);
        assert_eq!(
            resolver.resolve_platform_reference("leap-15.3-selinux").unwrap(),
            ("leap-15.3".to_string(), vec!["selinux".to_string()])
        );
        assert_eq!(
            resolver.resolve_platform_reference("leap-15.3-fips-selinux").unwrap().1,
            vec!["fips".to_string(), "selinux".to_string()]
        );
        assert!(matches!(
            resolver.resolve_platform_reference("leap-15.3-apparmor"),
            Err(ConfigError::UnknownReference { kind: "platform", .. })
        ));
    }

    #[test]
    fn test_conflict_detected() {
        let catalog = catalog(&format!("{BASE} node n {{ platform leap-15.3; build fips, selinux; }}"));
        let err = Resolver::new(&catalog)
            .compile(Purpose::Testing, &AnswerSet::new())
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Incompatible { ref build, ref feature, constraint: Constraint::Conflicts }
                if build == "fips" && feature == "selinux"
        ));
    }

    #[test]
    fn test_requires_missing_feature() {
        let catalog = catalog(
            "platform bare { vendor x; os y; } build selinux { compatibility { requires systemd; } } node n { platform bare-selinux; }",
        );
        let err = Resolver::new(&catalog)
            .compile(Purpose::Testing, &AnswerSet::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Incompatible { constraint: Constraint::Requires, .. }));
    }

    #[test]
    fn test_repository_must_be_defined() {
        let catalog = catalog(&format!("{BASE} node n {{ platform leap-15.3; repositories oss, update; }}"));
        let err = Resolver::new(&catalog)
            .compile(Purpose::Testing, &AnswerSet::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { kind: "repository", ref name, .. } if name == "update"));
    }

    #[test]
    fn test_strict_needs_vendor_and_os() {
        let catalog = catalog("platform p { vendor v; } node n { platform p; }");
        let err = Resolver::new(&catalog)
            .compile(Purpose::Init, &AnswerSet::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingAttribute { attribute: "os", .. }));
    }

    #[test]
    #[traced_test]
    fn test_lenient_purpose_yields_skeleton() {
        let catalog = catalog("node n { platform gone; } node m { }");
        let compiled = Resolver::new(&catalog)
            .compile(Purpose::Destroy, &AnswerSet::new())
            .unwrap();

        assert_eq!(compiled.nodes.len(), 2);
        assert!(compiled.nodes.iter().all(|n| n.skeleton));
        assert!(logs_contain("continuing without its configuration"));
    }

    #[test]
    fn test_no_nodes() {
        let catalog = catalog(BASE);
        assert!(matches!(
            Resolver::new(&catalog).compile(Purpose::Testing, &AnswerSet::new()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_platform_cycle() {
        let catalog = catalog(
            "platform a { use-base-platforms b; vendor v; os o; } platform b { use-base-platforms a; } node n { platform a; }",
        );
        let resolver = Resolver::new(&catalog);
        assert!(matches!(resolver.validate(), Err(ConfigError::InheritanceCycle { kind: "platform", .. })));
        assert!(matches!(
            resolver.compile(Purpose::Testing, &AnswerSet::new()),
            Err(ConfigError::InheritanceCycle { .. })
        ));
    }

    #[test]
    fn test_requirement_markers() {
        let catalog = catalog(&format!(
            "{BASE} requirement reg {{ item code {{ }} }} role default {{ requires reg; }} node n {{ platform leap-15.3; }}"
        ));
        let resolver = Resolver::new(&catalog);
        let compiled = resolver.compile(Purpose::Testing, &AnswerSet::new()).unwrap();
        assert_eq!(compiled.unresolved(), vec![("reg".to_string(), "n".to_string())]);

        let mut answers = AnswerSet::new();
        answers.insert("reg", "n", [("code".to_string(), "42".to_string())].into_iter().collect());
        let compiled = resolver.compile(Purpose::Testing, &answers).unwrap();
        assert!(compiled.unresolved().is_empty());
    }
}
