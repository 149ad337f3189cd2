//! Lifecycle commands

use super::{CommandResult, Context};
use twopence_config::Purpose;
use twopence_topology::{Bom, CreateOptions, Progress, ProvisionReport, TopologyStatus};

fn report(operation: &str, report: &ProvisionReport) -> CommandResult {
    for mismatch in &report.reconciliations {
        println!("  ! {mismatch}");
    }
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(Progress::Completed) => println!("  {}: provisioned", outcome.node),
            Ok(Progress::RebootPending(checkpoint)) => {
                println!("  {}: {checkpoint}; reboot and run resume", outcome.node);
            }
            Ok(Progress::Started) => println!("  {}: started", outcome.node),
            Ok(Progress::Destroyed) => println!("  {}: destroyed", outcome.node),
            Err(err) => println!("  {}: FAILED: {err}", outcome.node),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        return Err(format!("{operation} failed for {failed} of {} instances", report.outcomes.len()).into());
    }
    Ok(())
}

fn print_status(status: &TopologyStatus) {
    println!(
        "{} topology{}",
        status.backend,
        status.testcase.as_deref().map(|t| format!(" {t}")).unwrap_or_default()
    );
    if status.nodes.is_empty() {
        println!("  no instances");
    }
    for node in status.nodes.values() {
        print!("  {:<16} {:<10}", node.name, node.state.to_string());
        if let Some(target) = &node.target {
            print!(" {target}");
        }
        if let Some(checkpoint) = &node.checkpoint {
            print!(" ({checkpoint})");
        }
        println!();
    }
}

pub async fn create(context: &Context, auto_destroy: bool, build: bool) -> CommandResult {
    let purpose = if build { Purpose::Build } else { Purpose::Testing };
    let engine = context.open_engine(purpose)?;
    let options = CreateOptions {
        auto_destroy,
        image_build: build,
    };
    report("create", &engine.create(options).await?)
}

pub async fn resume(context: &Context) -> CommandResult {
    let bom = Bom::load(&context.workspace)?;
    let purpose = if context.workspace.load_status(bom.backend)?.resumes_image_build() {
        Purpose::Build
    } else {
        Purpose::Testing
    };
    let engine = context.open_engine(purpose)?;
    report("resume", &engine.resume().await?)
}

pub async fn start(context: &Context) -> CommandResult {
    let engine = context.open_engine(Purpose::Status)?;
    report("start", &engine.start().await?)
}

pub async fn stop(context: &Context) -> CommandResult {
    let engine = context.open_engine(Purpose::Status)?;
    for node in engine.stop().await? {
        println!("  {node}: stopped");
    }
    Ok(())
}

pub async fn status(context: &Context, json: bool) -> CommandResult {
    let engine = context.open_engine(Purpose::Status)?;
    let _ = engine.detect().await?;
    let status = engine.status().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

pub async fn destroy(context: &Context, zap: bool) -> CommandResult {
    let engine = context.open_engine(Purpose::Destroy)?;
    report("destroy", &engine.destroy(zap).await?)
}

pub async fn package(context: &Context, node: Option<&str>, target: &str) -> CommandResult {
    let engine = context.open_engine(Purpose::Build)?;
    let artifact = engine.package(node, target).await?;
    println!(
        "Packaged {} image {}; platform definition in {}",
        artifact.backend,
        artifact.name,
        artifact.metadata.display()
    );
    Ok(())
}
