//! Resource schema: subsystems, packages, executables, files, directories
//! and services a platform is expected to provide.
//!
//! ```text
//! resources "suse" {
//!     subsystem selinux {
//!         packages policycoreutils;
//!         package selinux-policy-targeted { }
//!     }
//!     package openssh {
//!         executable ssh { path /usr/bin/ssh; mode 0755; owner root; }
//!         service sshd { unit sshd.service; }
//!     }
//! }
//! ```
//!
//! Resource sets are pure data. The resolver only reads them.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use twopence_curly::Block;

/// Kind of a described resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Group of packages providing one capability
    Subsystem,
    /// Installable package
    Package,
    /// Executable file
    Executable,
    /// Regular file
    File,
    /// Directory
    Directory,
    /// System service
    Service,
}

impl ResourceKind {
    /// Parse a block keyword.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "subsystem" => Some(ResourceKind::Subsystem),
            "package" => Some(ResourceKind::Package),
            "executable" => Some(ResourceKind::Executable),
            "file" => Some(ResourceKind::File),
            "directory" => Some(ResourceKind::Directory),
            "service" => Some(ResourceKind::Service),
            _ => None,
        }
    }

    /// Block keyword of this kind.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            ResourceKind::Subsystem => "subsystem",
            ResourceKind::Package => "package",
            ResourceKind::Executable => "executable",
            ResourceKind::File => "file",
            ResourceKind::Directory => "directory",
            ResourceKind::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Ownership and mode of a file system resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Owning user
    pub owner: Option<String>,
    /// Owning group
    pub group: Option<String>,
    /// Permission bits
    pub mode: Option<u32>,
}

/// Failure that is expected while a feature is active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedFailure {
    /// Feature that triggers the failure
    pub feature: String,
    /// Explanation reported instead of an error
    pub reason: String,
}

/// One described resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource name
    pub name: String,
    /// Remaining attributes in first-seen order of values
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Ownership and mode, if any was given
    pub permissions: Option<Permissions>,
    /// Expected failures keyed by feature
    pub expected_failures: Vec<ExpectedFailure>,
    /// Enclosing resource
    pub parent: Option<(ResourceKind, String)>,
}

impl ResourceDescriptor {
    /// First value of an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn merge_from(&mut self, other: ResourceDescriptor) {
        for (name, values) in other.attributes {
            let existing = self.attributes.entry(name).or_default();
            for value in values {
                if !existing.contains(&value) {
                    existing.push(value);
                }
            }
        }
        if other.permissions.is_some() {
            self.permissions = other.permissions;
        }
        for failure in other.expected_failures {
            if !self.expected_failures.contains(&failure) {
                self.expected_failures.push(failure);
            }
        }
        if other.parent.is_some() {
            self.parent = other.parent;
        }
    }
}

/// Named set of resource descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    /// Set name, referenced by platforms and builds
    pub name: String,
    resources: BTreeMap<(ResourceKind, String), ResourceDescriptor>,
}

impl ResourceSet {
    /// Create an empty set.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// Build a set from a `resources "<name>" { ... }` block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for unnamed resources or a bad mode.
    pub fn from_block(block: &Block) -> ConfigResult<Self> {
        let mut set = Self::new(block.name_or_empty());
        set.absorb_children(block, None)?;
        Ok(set)
    }

    fn absorb_children(
        &mut self,
        block: &Block,
        parent: Option<(ResourceKind, String)>,
    ) -> ConfigResult<()> {
        for child in block.blocks() {
            let Some(kind) = ResourceKind::from_keyword(&child.kind) else {
                if child.kind != "expected-failure" {
                    tracing::debug!("Ignoring unknown resource kind {}", child.kind);
                }
                continue;
            };
            let Some(name) = child.name.clone() else {
                return Err(ConfigError::Invalid(format!(
                    "{kind} in resource set \"{}\" has no name",
                    self.name
                )));
            };

            let descriptor = descriptor_from_block(kind, &name, child, parent.clone())?;
            self.insert(descriptor);
            self.absorb_children(child, Some((kind, name)))?;
        }
        Ok(())
    }

    fn insert(&mut self, descriptor: ResourceDescriptor) {
        let key = (descriptor.kind, descriptor.name.clone());
        match self.resources.get_mut(&key) {
            Some(existing) => existing.merge_from(descriptor),
            None => {
                let _ = self.resources.insert(key, descriptor);
            }
        }
    }

    /// Merge a later definition of the same set into this one.
    pub fn merge_from(&mut self, other: ResourceSet) {
        for (_, descriptor) in other.resources {
            self.insert(descriptor);
        }
    }

    /// Look up a resource.
    #[must_use]
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(&(kind, name.to_string()))
    }

    /// Iterate all resources, ordered by kind then name.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.values()
    }

    /// Packages providing `name`.
    ///
    /// A subsystem expands to its `packages` attribute plus nested packages;
    /// a described package maps to itself.
    #[must_use]
    pub fn packages_for(&self, name: &str) -> Option<Vec<String>> {
        if let Some(subsystem) = self.get(ResourceKind::Subsystem, name) {
            let mut packages: Vec<String> = subsystem
                .attributes
                .get("packages")
                .cloned()
                .unwrap_or_default();
            let parent = Some((ResourceKind::Subsystem, name.to_string()));
            for nested in self
                .resources()
                .filter(|r| r.kind == ResourceKind::Package && r.parent == parent)
            {
                if !packages.contains(&nested.name) {
                    packages.push(nested.name.clone());
                }
            }
            return Some(packages);
        }

        self.get(ResourceKind::Package, name)
            .map(|package| vec![package.name.clone()])
    }

    /// Unit name of a described service.
    #[must_use]
    pub fn service_unit(&self, name: &str) -> Option<String> {
        self.get(ResourceKind::Service, name)
            .map(|service| service.attribute("unit").unwrap_or(&service.name).to_string())
    }

    /// Reason a resource is expected to fail under the active features.
    #[must_use]
    pub fn expected_failure<'a, I>(&self, kind: ResourceKind, name: &str, features: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let resource = self.get(kind, name)?;
        let active: Vec<&String> = features.into_iter().collect();
        resource
            .expected_failures
            .iter()
            .find(|failure| active.contains(&&failure.feature))
            .map(|failure| failure.reason.as_str())
    }
}

fn descriptor_from_block(
    kind: ResourceKind,
    name: &str,
    block: &Block,
    parent: Option<(ResourceKind, String)>,
) -> ConfigResult<ResourceDescriptor> {
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut permissions = Permissions::default();
    let mut has_permissions = false;

    for attr in block.attributes() {
        match attr.name.as_str() {
            "owner" => {
                permissions.owner = attr.values.first().cloned();
                has_permissions = true;
            }
            "group" => {
                permissions.group = attr.values.first().cloned();
                has_permissions = true;
            }
            "mode" => {
                let raw = attr.values.first().map_or("", String::as_str);
                let digits = raw.trim_start_matches("0o");
                let mode = u32::from_str_radix(digits, 8).map_err(|_| {
                    ConfigError::Invalid(format!("{kind} \"{name}\" has invalid mode \"{raw}\""))
                })?;
                permissions.mode = Some(mode);
                has_permissions = true;
            }
            other => {
                let values = attributes.entry(other.to_string()).or_default();
                for value in &attr.values {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
        }
    }

    let expected_failures = block
        .blocks_of("expected-failure")
        .map(|failure| ExpectedFailure {
            feature: failure.name_or_empty().to_string(),
            reason: failure.get("reason").unwrap_or("expected failure").to_string(),
        })
        .collect();

    Ok(ResourceDescriptor {
        kind,
        name: name.to_string(),
        attributes,
        permissions: has_permissions.then_some(permissions),
        expected_failures,
        parent,
    })
}
