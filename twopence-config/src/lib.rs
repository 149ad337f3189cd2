//! Configuration resolution for test topologies.
//!
//! Configuration fragments are loaded into a [`Catalog`] of platforms,
//! builds, roles, nodes, resource sets and requirements. The [`Resolver`]
//! compiles the catalog into one [`InstanceConfig`] per node, and the
//! [`RecipeAssembler`] turns an instance config into a [`StagePlan`].
//!
//! ```
//! use twopence_config::{AnswerSet, Catalog, Purpose, Resolver};
//! use twopence_curly::parse_str;
//!
//! let mut catalog = Catalog::new();
//! catalog.absorb(&parse_str(r#"
//!     platform leap-15.3 { vendor suse; os leap-15.3; features systemd; }
//!     node client { platform leap-15.3; }
//! "#).unwrap()).unwrap();
//!
//! let compiled = Resolver::new(&catalog)
//!     .compile(Purpose::Testing, &AnswerSet::new())
//!     .unwrap();
//! assert!(compiled.node("client").unwrap().features.contains("systemd"));
//! ```

pub mod catalog;
pub mod error;
pub mod model;
pub mod ordered;
pub mod recipe;
pub mod requirements;
pub mod resolver;
pub mod resource;

pub use catalog::{Catalog, ConfigSources, DEFAULT_ROLE, SourceRecord};
pub use error::{ConfigError, ConfigResult, Constraint, RequirementError, RequirementResult};
pub use model::{
    Assignment, BackendSettings, Build, ImageDescriptor, Invocation, Node, Platform, Repository,
    Role, Stage, StageFilter,
};
pub use ordered::UniqueList;
pub use recipe::{PlannedStage, RecipeAssembler, RunContext, ShellLibrary, Step, StagePlan};
pub use requirements::{
    AnswerLocations, AnswerSet, Answers, NonInteractive, Prompter, RequirementCache,
    RequirementCatalog, RequirementDef, Requirements, Scope, TerminalPrompter,
};
pub use resolver::{CompiledConfig, InstanceConfig, Purpose, Resolver};
pub use resource::{ResourceDescriptor, ResourceKind, ResourceSet};
