//! twopence-provision command-line interface
//!
//! - `init`: create a workspace from configuration fragments
//! - `create`, `resume`, `start`, `stop`, `destroy`, `package`: lifecycle
//! - `status`, `show-config`: inspection

use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use twopence_config::{
    AnswerLocations, AnswerSet, Catalog, CompiledConfig, ConfigSources, NonInteractive, Prompter,
    Purpose, RecipeAssembler, RequirementCache, RequirementCatalog, Requirements, Resolver,
    ShellLibrary, TerminalPrompter,
};
use twopence_topology::{
    Backend, BackendKind, Bom, CommandRunner, ProcessRunner, TopologyEngine, Workspace,
};

pub mod lifecycle;
pub mod workspace;

/// Result of a command
pub type CommandResult = Result<(), Box<dyn Error>>;

/// Provision test topologies on vagrant and podman
#[derive(Debug, Parser)]
#[command(name = "twopence-provision")]
#[command(about = "Provision test topologies on vagrant and podman")]
#[command(version)]
pub struct Cli {
    /// Print debug information
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Workspace directory
    #[arg(short, long, env = "TWOPENCE_WORKSPACE", default_value = ".", global = true)]
    pub workspace: PathBuf,

    /// Extra directories searched for included configuration files
    #[arg(long, env = "TWOPENCE_CONFIG_PATH", value_delimiter = ':', global = true)]
    pub config_path: Vec<PathBuf>,

    /// Directories holding the shell library stages call into
    #[arg(
        long,
        env = "TWOPENCE_SCRIPT_PATH",
        value_delimiter = ':',
        default_value = "/usr/lib/twopence/provision",
        global = true
    )]
    pub script_path: Vec<PathBuf>,

    /// Never prompt; fail on unanswered requirements
    #[arg(long, global = true)]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a workspace for a topology
    Init {
        /// Backend to run instances on
        #[arg(short, long, default_value = "podman")]
        backend: BackendKind,

        /// Configuration fragments, in load order
        #[arg(required = true)]
        configs: Vec<PathBuf>,
    },

    /// Create, start and provision all instances
    Create {
        /// Stop and destroy existing instances first
        #[arg(long)]
        auto_destroy: bool,

        /// Provision for an image build; enables `only build` stages
        #[arg(long)]
        build: bool,
    },

    /// Continue provisioning after a reboot
    Resume,

    /// Boot stopped instances
    Start,

    /// Shut running instances down
    Stop,

    /// Show instance states
    Status {
        /// Print the status file as JSON
        #[arg(long)]
        json: bool,
    },

    /// Destroy all instances
    Destroy {
        /// Also remove the status file and the BOM
        #[arg(long)]
        zap: bool,
    },

    /// Export the single instance as a new image
    Package {
        /// Instance to package; must be the only one
        #[arg(short, long)]
        node: Option<String>,

        /// Name of the new image and platform
        target: String,
    },

    /// Print the compiled configuration as JSON
    ShowConfig {
        /// Purpose to compile for
        #[arg(short, long, value_enum, default_value = "testing")]
        purpose: PurposeArg,
    },
}

/// Purposes selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurposeArg {
    Init,
    Testing,
    Build,
    Status,
    Login,
    Destroy,
}

impl From<PurposeArg> for Purpose {
    fn from(arg: PurposeArg) -> Self {
        match arg {
            PurposeArg::Init => Purpose::Init,
            PurposeArg::Testing => Purpose::Testing,
            PurposeArg::Build => Purpose::Build,
            PurposeArg::Status => Purpose::Status,
            PurposeArg::Login => Purpose::Login,
            PurposeArg::Destroy => Purpose::Destroy,
        }
    }
}

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct Context {
    pub workspace: Workspace,
    pub config_path: Vec<PathBuf>,
    pub script_path: Vec<PathBuf>,
    pub interactive: bool,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            workspace: Workspace::new(&cli.workspace),
            config_path: cli.config_path.clone(),
            script_path: cli.script_path.clone(),
            interactive: !cli.non_interactive,
        }
    }

    pub fn sources(&self, configs: &[PathBuf]) -> ConfigSources {
        let mut sources = ConfigSources::standard().with_fragments(configs.iter().cloned());
        sources.search_paths.extend(self.config_path.iter().cloned());
        sources
    }

    /// Compile the catalog, asking for requirement answers when the
    /// purpose needs them.
    pub fn compile(&self, catalog: &Catalog, purpose: Purpose) -> Result<CompiledConfig, Box<dyn Error>> {
        let resolver = Resolver::new(catalog);
        let draft = resolver.compile(purpose, &AnswerSet::new())?;
        if !purpose.is_strict() || draft.unresolved().is_empty() {
            return Ok(draft);
        }

        let referenced = RequirementCatalog::scan(&draft, catalog)?;
        debug!(
            "Topology references requirements {}",
            referenced.names().collect::<Vec<_>>().join(", ")
        );
        let locations = AnswerLocations::standard(Some(self.workspace.root()));
        let mut cache = RequirementCache::load(locations)?;
        let mut terminal = TerminalPrompter;
        let mut unattended = NonInteractive;
        let prompter: &mut dyn Prompter = if self.interactive {
            &mut terminal
        } else {
            &mut unattended
        };
        let answers = Requirements::new(catalog, &mut cache, prompter).satisfy(&referenced)?;
        let written = cache.flush()?;
        debug!("Wrote {written} answer files");

        Ok(resolver.compile(purpose, &answers)?)
    }

    /// Load the workspace configuration and lock the workspace.
    pub fn open_engine(&self, purpose: Purpose) -> Result<TopologyEngine<Backend>, Box<dyn Error>> {
        let bom = Bom::load(&self.workspace)?;
        let catalog = Catalog::load(&self.sources(&bom.configs))?;
        let compiled = self.compile(&catalog, purpose)?;

        let testcase = compiled.testcase.clone().or(bom.testcase);
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::default());
        let backend = Backend::new(
            bom.backend,
            catalog.backends.get(bom.backend.name()),
            testcase.as_deref(),
            runner,
        )?;
        let assembler = RecipeAssembler::new(ShellLibrary::new(self.script_path.iter().cloned()));

        info!(
            "Workspace {} ({} backend, {} nodes, {purpose})",
            self.workspace.root().display(),
            bom.backend,
            compiled.nodes.len()
        );
        Ok(TopologyEngine::open(self.workspace.clone(), backend, compiled, assembler)?)
    }
}

/// Run a parsed command line.
pub async fn execute(cli: Cli) -> CommandResult {
    let context = Context::from_cli(&cli);
    match cli.command {
        Commands::Init { backend, configs } => workspace::init(&context, backend, &configs),
        Commands::ShowConfig { purpose } => workspace::show_config(&context, purpose.into()),
        Commands::Create {
            auto_destroy,
            build,
        } => lifecycle::create(&context, auto_destroy, build).await,
        Commands::Resume => lifecycle::resume(&context).await,
        Commands::Start => lifecycle::start(&context).await,
        Commands::Stop => lifecycle::stop(&context).await,
        Commands::Status { json } => lifecycle::status(&context, json).await,
        Commands::Destroy { zap } => lifecycle::destroy(&context, zap).await,
        Commands::Package { node, target } => {
            lifecycle::package(&context, node.as_deref(), &target).await
        }
    }
}
