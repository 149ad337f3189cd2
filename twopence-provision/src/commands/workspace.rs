//! Workspace setup and configuration inspection

use super::{CommandResult, Context};
use std::path::{PathBuf, absolute};
use tracing::info;
use twopence_config::{Catalog, Purpose, Resolver};
use twopence_topology::{BackendKind, Bom};

/// Validate the fragments and write the BOM.
pub fn init(context: &Context, backend: BackendKind, configs: &[PathBuf]) -> CommandResult {
    let configs = configs
        .iter()
        .map(absolute)
        .collect::<Result<Vec<_>, _>>()?;

    let catalog = Catalog::load(&context.sources(&configs))?;
    Resolver::new(&catalog).validate()?;
    let compiled = context.compile(&catalog, Purpose::Init)?;
    let nodes: Vec<&str> = compiled.nodes.iter().map(|node| node.name.as_str()).collect();
    info!("Topology has nodes {}", nodes.join(", "));

    let bom = Bom::init(&context.workspace, backend, catalog.testcase.clone(), configs)?;
    println!(
        "Initialized {} workspace {} with {} configuration files",
        bom.backend,
        context.workspace.root().display(),
        bom.configs.len()
    );
    Ok(())
}

/// Print the compiled configuration.
pub fn show_config(context: &Context, purpose: Purpose) -> CommandResult {
    let bom = Bom::load(&context.workspace)?;
    let catalog = Catalog::load(&context.sources(&bom.configs))?;
    let compiled = context.compile(&catalog, purpose)?;

    for (requirement, node) in compiled.unresolved() {
        eprintln!("warning: {node}: requirement {requirement} has no answer");
    }
    println!("{}", compiled.to_json()?);
    Ok(())
}
