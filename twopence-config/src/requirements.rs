//! Requirements: information a node needs that configuration cannot supply,
//! such as registration codes or credentials.
//!
//! ```text
//! requirement "suse-registration" {
//!     valid permanent;
//!     item regcode { prompt "SUSE registration code"; secret; }
//!     item email { prompt "E-mail address"; default "qa@example.com"; }
//! }
//! ```
//!
//! Answers are looked up in the process cache, then in answer files, and
//! only then requested from an injected [`Prompter`]. Answer files are curly
//! documents stored under `<dir>/requirements/`.

use crate::catalog::Catalog;
use crate::error::{ConfigError, ConfigResult, RequirementError, RequirementResult};
use crate::resolver::CompiledConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use twopence_curly::{Attribute, Block, Loader};

/// Item name to answer
pub type Answers = BTreeMap<String, String>;

/// How widely an answer is shared and where it is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per node, stored in the workspace
    Node,
    /// Shared by all nodes of the topology, stored in the workspace
    AllNodes,
    /// Shared beyond the workspace, stored in the user config dir
    Permanent,
}

impl Scope {
    fn parse(value: &str) -> ConfigResult<Self> {
        match value {
            "node" => Ok(Scope::Node),
            "allnodes" => Ok(Scope::AllNodes),
            "permanent" => Ok(Scope::Permanent),
            other => Err(ConfigError::Invalid(format!(
                "unknown requirement scope \"{other}\""
            ))),
        }
    }
}

/// One prompted value of a requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptItem {
    /// Item name
    pub name: String,
    /// Prompt text
    pub prompt: Option<String>,
    /// Value used on empty input
    pub default: Option<String>,
    /// Never echoed or logged
    pub secret: bool,
}

/// `requirement "<name>" { ... }` definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementDef {
    /// Requirement name
    pub name: String,
    /// Declared scope
    pub valid: Option<Scope>,
    /// Items in declaration order
    pub items: Vec<PromptItem>,
}

impl RequirementDef {
    /// Build from a requirement block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an unknown scope.
    pub fn from_block(block: &Block) -> ConfigResult<Self> {
        let valid = block.get("valid").map(Scope::parse).transpose()?;
        let items = block
            .blocks_of("item")
            .map(|item| PromptItem {
                name: item.name_or_empty().to_string(),
                prompt: item.get("prompt").map(str::to_string),
                default: item.get("default").map(str::to_string),
                secret: item.flag("secret").unwrap_or(false),
            })
            .collect();

        Ok(Self {
            name: block.name_or_empty().to_string(),
            valid,
            items,
        })
    }

    /// Absorb a later definition.
    pub fn merge_from(&mut self, other: RequirementDef) {
        if other.valid.is_some() {
            self.valid = other.valid;
        }
        for item in other.items {
            match self.items.iter_mut().find(|i| i.name == item.name) {
                Some(existing) => *existing = item,
                None => self.items.push(item),
            }
        }
    }

    /// Effective scope. Defaults to `allnodes`.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.valid.unwrap_or(Scope::AllNodes)
    }

    /// Cache key of this requirement for a node.
    #[must_use]
    pub fn key(&self, node: &str) -> String {
        match self.scope() {
            Scope::Node => format!("{}@{node}", self.name),
            Scope::AllNodes | Scope::Permanent => self.name.clone(),
        }
    }
}

/// Answers handed to the resolver, keyed by requirement and node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet {
    answers: BTreeMap<(String, String), Answers>,
}

impl AnswerSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record answers of `name` for `node`.
    pub fn insert(&mut self, name: &str, node: &str, answers: Answers) {
        let _ = self
            .answers
            .insert((name.to_string(), node.to_string()), answers);
    }

    /// Answers of `name` for `node`.
    #[must_use]
    pub fn get(&self, name: &str, node: &str) -> Option<&Answers> {
        self.answers.get(&(name.to_string(), node.to_string()))
    }

    /// Number of (requirement, node) pairs answered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    /// Whether nothing is answered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// Requirement names referenced by a compiled configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementCatalog {
    entries: BTreeMap<String, Vec<String>>,
}

impl RequirementCatalog {
    /// Collect every requirement referenced by any node.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownReference` for undefined requirements.
    pub fn scan(compiled: &CompiledConfig, catalog: &Catalog) -> ConfigResult<Self> {
        let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &compiled.nodes {
            for name in node.requirements.keys() {
                if !catalog.requirements.contains_key(name) {
                    return Err(ConfigError::UnknownReference {
                        kind: "requirement",
                        name: name.clone(),
                        context: Some(format!("node {}", node.name)),
                    });
                }
                entries.entry(name.clone()).or_default().push(node.name.clone());
            }
        }
        Ok(Self { entries })
    }

    /// Requirement names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Nodes referencing a requirement.
    #[must_use]
    pub fn nodes_for(&self, name: &str) -> &[String] {
        self.entries.get(name).map_or(&[][..], Vec::as_slice)
    }
}

/// Interactive source of answers
pub trait Prompter {
    /// Whether the prompter can ask at all
    fn interactive(&self) -> bool;

    /// Ask for one item. `None` means no input.
    ///
    /// # Errors
    ///
    /// I/O failures talking to the user.
    fn prompt(
        &mut self,
        requirement: &str,
        item: &PromptItem,
        default: Option<&str>,
    ) -> RequirementResult<Option<String>>;
}

/// Prompter for unattended runs; never answers
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn interactive(&self) -> bool {
        false
    }

    fn prompt(&mut self, _: &str, _: &PromptItem, _: Option<&str>) -> RequirementResult<Option<String>> {
        Ok(None)
    }
}

/// Prompter reading answers from stdin, prompting on stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn interactive(&self) -> bool {
        true
    }

    fn prompt(
        &mut self,
        requirement: &str,
        item: &PromptItem,
        default: Option<&str>,
    ) -> RequirementResult<Option<String>> {
        let io_err = |source| RequirementError::Io {
            path: "<terminal>".to_string(),
            source,
        };
        let text = item.prompt.as_deref().unwrap_or(&item.name);
        let mut stderr = std::io::stderr();
        let written = match default {
            Some(default) if !item.secret => write!(stderr, "[{requirement}] {text} [{default}]: "),
            _ => write!(stderr, "[{requirement}] {text}: "),
        };
        written.map_err(io_err)?;
        stderr.flush().map_err(io_err)?;

        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line).map_err(io_err)?;
        let answer = line.trim();
        Ok((read > 0 && !answer.is_empty()).then(|| answer.to_string()))
    }
}

/// Directories holding `requirements/` answer files
#[derive(Debug, Clone, Default)]
pub struct AnswerLocations {
    /// System-wide answers, read only
    pub global: Option<PathBuf>,
    /// Per-user answers, written for `permanent` requirements
    pub user: Option<PathBuf>,
    /// Workspace answers, written for `node` and `allnodes` requirements
    pub workspace: Option<PathBuf>,
}

impl AnswerLocations {
    /// `/etc/twopence`, `<config dir>/twopence` and the workspace.
    #[must_use]
    pub fn standard(workspace: Option<&Path>) -> Self {
        Self {
            global: Some(PathBuf::from("/etc/twopence")),
            user: dirs::config_dir().map(|dir| dir.join("twopence")),
            workspace: workspace.map(Path::to_path_buf),
        }
    }

    fn read_order(&self) -> impl Iterator<Item = &PathBuf> {
        self.global.iter().chain(self.user.iter()).chain(self.workspace.iter())
    }
}

/// Process-scoped answer cache
///
/// Loaded once at command start, flushed once at exit.
#[derive(Debug, Default)]
pub struct RequirementCache {
    locations: AnswerLocations,
    answers: BTreeMap<String, Answers>,
    history: BTreeMap<String, Answers>,
    dirty: BTreeSet<(String, ScopeTag)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ScopeTag {
    Workspace,
    User,
}

impl RequirementCache {
    /// Read every answer file in the given locations.
    ///
    /// # Errors
    ///
    /// Unreadable or malformed answer files.
    pub fn load(locations: AnswerLocations) -> RequirementResult<Self> {
        let mut cache = Self {
            locations,
            ..Self::default()
        };

        let dirs: Vec<PathBuf> = cache
            .locations
            .read_order()
            .map(|dir| dir.join("requirements"))
            .filter(|dir| dir.is_dir())
            .collect();

        let mut loader = Loader::new();
        for dir in dirs {
            let entries = fs::read_dir(&dir).map_err(|source| RequirementError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
                .collect();
            files.sort();

            for file in files {
                let doc = loader.load(&file)?;
                for block in doc.root.blocks_of("requirement") {
                    let answers: Answers = block
                        .attributes()
                        .map(|attr| (attr.name.clone(), attr.values.join(" ")))
                        .collect();
                    let key = block.name_or_empty().to_string();
                    let name = key.split('@').next().unwrap_or_default().to_string();
                    debug!("Loaded answers for {key} from {}", file.display());
                    let _ = cache.history.insert(name, answers.clone());
                    let _ = cache.answers.insert(key, answers);
                }
            }
        }

        Ok(cache)
    }

    /// Cached answers under a key.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Answers> {
        self.answers.get(key)
    }

    /// Previously given answers of a requirement, used as prompt defaults.
    #[must_use]
    pub fn history(&self, name: &str) -> Option<&Answers> {
        self.history.get(name)
    }

    /// Remember answers and schedule them for persistence.
    pub fn store(&mut self, def: &RequirementDef, node: &str, answers: Answers) {
        let key = def.key(node);
        let tag = match def.scope() {
            Scope::Permanent => ScopeTag::User,
            Scope::Node | Scope::AllNodes => ScopeTag::Workspace,
        };
        let _ = self.history.insert(def.name.clone(), answers.clone());
        let _ = self.answers.insert(key.clone(), answers);
        let _ = self.dirty.insert((key, tag));
    }

    /// Write every answer stored since load. Returns the number of files.
    ///
    /// # Errors
    ///
    /// Answer files that cannot be written.
    pub fn flush(&mut self) -> RequirementResult<usize> {
        let mut written = 0;
        for (key, tag) in std::mem::take(&mut self.dirty) {
            let dir = match tag {
                ScopeTag::User => self.locations.user.as_ref(),
                ScopeTag::Workspace => self.locations.workspace.as_ref(),
            };
            let Some(dir) = dir else {
                warn!("No location to persist answers for {key}");
                continue;
            };
            let Some(answers) = self.answers.get(&key) else {
                continue;
            };

            let mut block = Block::new("requirement", Some(&key));
            for (item, value) in answers {
                block.push_attribute(Attribute::new(item, [value.as_str()]));
            }
            write_private(&dir.join("requirements").join(format!("{key}.conf")), &block.to_curly())?;
            written += 1;
        }
        if written > 0 {
            info!("Saved {written} requirement answer file(s)");
        }
        Ok(written)
    }
}

fn write_private(path: &Path, content: &str) -> RequirementResult<()> {
    let io_err = |source| RequirementError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)
}

/// Resolves requirement answers for nodes
pub struct Requirements<'a> {
    catalog: &'a Catalog,
    cache: &'a mut RequirementCache,
    prompter: &'a mut dyn Prompter,
}

impl<'a> Requirements<'a> {
    /// Combine definitions, the process cache and a prompter.
    pub fn new(
        catalog: &'a Catalog,
        cache: &'a mut RequirementCache,
        prompter: &'a mut dyn Prompter,
    ) -> Self {
        Self {
            catalog,
            cache,
            prompter,
        }
    }

    /// Answers of requirement `name` for `node`.
    ///
    /// # Errors
    ///
    /// `Unknown` for undefined requirements, `Unresolved` when nothing is
    /// stored and the prompter cannot supply every item.
    pub fn resolve(&mut self, name: &str, node: &str) -> RequirementResult<Answers> {
        let def = self
            .catalog
            .requirements
            .get(name)
            .ok_or_else(|| RequirementError::Unknown(name.to_string()))?;

        if let Some(answers) = self.cache.lookup(&def.key(node)) {
            return Ok(answers.clone());
        }

        let unresolved = || RequirementError::Unresolved {
            name: name.to_string(),
            node: node.to_string(),
        };
        if !self.prompter.interactive() {
            return Err(unresolved());
        }

        let history = self.cache.history(name).cloned().unwrap_or_default();
        let mut answers = Answers::new();
        for item in &def.items {
            let default = history
                .get(&item.name)
                .map(String::as_str)
                .or(item.default.as_deref());
            let value = match self.prompter.prompt(name, item, default)? {
                Some(value) => value,
                None => default.ok_or_else(unresolved)?.to_string(),
            };
            let _ = answers.insert(item.name.clone(), value);
        }

        debug!("Resolved requirement {name} for {node}");
        self.cache.store(def, node, answers.clone());
        Ok(answers)
    }

    /// Resolve every requirement of a scanned configuration.
    ///
    /// # Errors
    ///
    /// The first requirement that cannot be resolved.
    pub fn satisfy(&mut self, referenced: &RequirementCatalog) -> RequirementResult<AnswerSet> {
        let mut set = AnswerSet::new();
        for name in referenced.names() {
            for node in referenced.nodes_for(name) {
                let answers = self.resolve(name, node)?;
                set.insert(name, node, answers);
            }
        }
        Ok(set)
    }
}
