//! Vagrant boxes as test instances.
//!
//! Every instance lives in its own directory holding a Vagrantfile rendered
//! from a template. Steps run through `vagrant ssh -c`; the shell library is
//! synced into the box as part of the instance directory.

use crate::backend::{
    BackendDriver, BackendHandle, BackendKind, ImageArtifact, InstanceRecord, ObservedInstance,
    Settings, StageOutcome, StartInfo, instance_dir, stage_scripts, write_platform_metadata,
};
use crate::error::{BackendError, BackendResult};
use crate::runner::{CommandRunner, HostCommand, shell_quote};
use crate::state::InstanceState;
use crate::template::{DEFAULT_VAGRANTFILE, TemplateVars};
use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use twopence_config::{ImageDescriptor, InstanceConfig, PlannedStage, StagePlan};

/// Where the instance directory shows up inside the box
const SYNCED_DIR: &str = "/vagrant";

/// Vagrant backend
#[derive(Debug)]
pub struct VagrantBackend {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
}

impl VagrantBackend {
    /// Backend running `vagrant` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Self { runner, settings }
    }

    fn vagrant<I, S>(&self, dir: &Path, args: I) -> HostCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = HostCommand::new("vagrant").args(args).current_dir(dir);
        match self.settings.timeout {
            Some(timeout) => command.timeout(timeout),
            None => command,
        }
    }

    fn template(&self) -> BackendResult<String> {
        match &self.settings.template {
            Some(path) => fs::read_to_string(path).map_err(BackendError::io(path)),
            None => Ok(DEFAULT_VAGRANTFILE.to_string()),
        }
    }

    async fn ssh(&self, dir: &Path, line: &str) -> BackendResult<()> {
        let command = self.vagrant(dir, ["ssh", "-c"]).arg(format!("sudo sh -c {}", shell_quote(line)));
        let _ = self.runner.run_checked(&command).await?;
        Ok(())
    }
}

/// Machine state from `vagrant status --machine-readable`.
///
/// Only asked for instances whose Vagrantfile exists, so a box vagrant has
/// not created yet is prepared rather than absent.
pub fn parse_machine_state(output: &str) -> Option<InstanceState> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(',').collect();
        match fields.as_slice() {
            [_, _, "state", state, ..] => Some(match *state {
                "running" => InstanceState::Running,
                "not_created" => InstanceState::Prepared,
                _ => InstanceState::Stopped,
            }),
            _ => None,
        }
    })
}

/// Guest address from `vagrant up` output or `vagrant ssh-config`.
pub fn parse_ssh_address(output: &str) -> Option<String> {
    let patterns = [
        r"SSH address:\s*\[?([0-9A-Fa-f.:]+?)\]?:\d+\s*$",
        r"^\s*HostName\s+(\S+)\s*$",
    ];
    patterns.iter().find_map(|pattern| {
        let re = Regex::new(&format!("(?m){pattern}")).ok()?;
        re.captures(output).map(|caps| caps[1].to_string())
    })
}

fn template_vars(config: &InstanceConfig, image: &ImageDescriptor) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.set_opt("BOX", image.image.as_deref());
    vars.set_opt("BOX_URL", image.url.as_deref());
    vars.set("HOSTNAME", config.name.as_str());
    vars.set_opt("KEYFILE", config.keyfile.as_deref());
    vars.set_list(
        "ADD_REPOSITORIES",
        config.repositories.iter().filter_map(|repo| {
            repo.url.as_ref().map(|url| {
                format!(
                    "zypper --non-interactive addrepo --refresh {} {}",
                    shell_quote(url),
                    shell_quote(&repo.name)
                )
            })
        }),
    );
    let packages: Vec<String> = config.install.iter().map(|p| shell_quote(p)).collect();
    vars.set_list(
        "INSTALL_PACKAGES",
        (!packages.is_empty()).then(|| format!("zypper --non-interactive install {}", packages.join(" "))),
    );
    vars.set_list(
        "COMMANDS",
        config
            .start
            .iter()
            .map(|unit| format!("systemctl enable --now {}", shell_quote(unit))),
    );
    vars.set("NODE", config.name.as_str());
    vars.set_opt("PLATFORM", config.base_platform());
    for (key, values) in &config.info {
        vars.set_list(key, values.iter().cloned());
    }
    vars
}

#[async_trait]
impl BackendDriver for VagrantBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vagrant
    }

    async fn detect(&self, records: &[InstanceRecord]) -> BackendResult<Vec<ObservedInstance>> {
        let mut observed = Vec::with_capacity(records.len());
        for record in records {
            let Some(dir) = record.handle("dir").map(Path::new) else {
                observed.push(ObservedInstance::absent(&record.name));
                continue;
            };
            if !dir.join("Vagrantfile").is_file() {
                observed.push(ObservedInstance::absent(&record.name));
                continue;
            }

            let command = self.vagrant(dir, ["status", "--machine-readable"]);
            let output = self.runner.run_checked(&command).await?;
            let state = parse_machine_state(&output.stdout).unwrap_or_else(|| {
                warn!("{}: no state in vagrant status output", record.name);
                InstanceState::Prepared
            });
            debug!("{}: vagrant reports {state}", record.name);
            observed.push(ObservedInstance {
                name: record.name.clone(),
                state,
                handle: BackendHandle::new(),
            });
        }
        Ok(observed)
    }

    async fn prepare(
        &self,
        config: &InstanceConfig,
        plan: &StagePlan,
        instance_dir: &Path,
    ) -> BackendResult<BackendHandle> {
        let image = config
            .image_for("vagrant")
            .filter(|image| image.image.is_some())
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "vagrant box for platform {}",
                    config.base_platform().unwrap_or("?")
                ))
            })?;

        let vagrantfile = instance_dir.join("Vagrantfile");
        if vagrantfile.exists() {
            return Err(BackendError::InstanceExists(config.name.clone()));
        }
        fs::create_dir_all(instance_dir).map_err(BackendError::io(instance_dir))?;
        let _ = stage_scripts(plan, instance_dir)?;

        let rendered = template_vars(config, image).render(&self.template()?)?;
        fs::write(&vagrantfile, rendered).map_err(BackendError::io(&vagrantfile))?;
        info!("{}: wrote {}", config.name, vagrantfile.display());

        let mut handle = BackendHandle::new();
        let _ = handle.insert("dir".to_string(), instance_dir.display().to_string());
        let _ = handle.insert("provision".to_string(), format!("{SYNCED_DIR}/provision"));
        Ok(handle)
    }

    async fn start(&self, record: &InstanceRecord) -> BackendResult<StartInfo> {
        let dir = instance_dir(record)?;
        let mut args = vec!["up".to_string()];
        if let Some(provider) = &self.settings.provider {
            args.push(format!("--provider={provider}"));
        }
        let output = self.runner.run_checked(&self.vagrant(&dir, args)).await?;

        let address = match parse_ssh_address(&output.stdout) {
            Some(address) => Some(address),
            None => {
                let config = self.runner.run_checked(&self.vagrant(&dir, ["ssh-config"])).await?;
                parse_ssh_address(&config.stdout)
            }
        };
        match address {
            Some(address) => {
                info!("{}: up at {address}", record.name);
                Ok(StartInfo::reachable(&address, None))
            }
            None => {
                warn!("{}: could not determine the box address", record.name);
                Ok(StartInfo::default())
            }
        }
    }

    async fn run_stage(&self, record: &InstanceRecord, stage: &PlannedStage) -> BackendResult<StageOutcome> {
        let dir = instance_dir(record)?;
        let remote = record.handle("provision").unwrap_or(SYNCED_DIR);
        for step in &stage.steps {
            self.ssh(&dir, &step.shell_line(remote)).await?;
        }

        if !stage.reboot {
            return Ok(StageOutcome::Completed);
        }
        // The connection drops while the guest goes down
        let command = self.vagrant(&dir, ["ssh", "-c", "sudo systemctl reboot"]);
        let output = self.runner.run(&command).await?;
        debug!("{}: reboot requested (exit {:?})", record.name, output.code);
        Ok(StageOutcome::RebootRequired)
    }

    async fn stop(&self, record: &InstanceRecord) -> BackendResult<()> {
        let dir = instance_dir(record)?;
        let _ = self.runner.run_checked(&self.vagrant(&dir, ["halt"])).await?;
        Ok(())
    }

    async fn destroy(&self, record: &InstanceRecord) -> BackendResult<()> {
        let dir = instance_dir(record)?;
        if dir.join("Vagrantfile").is_file() {
            let _ = self.runner.run_checked(&self.vagrant(&dir, ["destroy", "-f"])).await?;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::io(&dir)(err)),
        }
    }

    async fn package(
        &self,
        record: &InstanceRecord,
        config: &InstanceConfig,
        target: &str,
        workspace: &Path,
    ) -> BackendResult<ImageArtifact> {
        let dir = instance_dir(record)?;
        let box_file = workspace.join(format!("{target}.box"));
        let command = self.vagrant(&dir, ["package", "--output"]).arg(box_file.display().to_string());
        let _ = self.runner.run_checked(&command).await?;

        let image = ImageDescriptor {
            backend: BackendKind::Vagrant.name().to_string(),
            image: Some(target.to_string()),
            registry: None,
            url: Some(format!("file://{}", box_file.display())),
            arch: config.arch.clone(),
        };
        let metadata = write_platform_metadata(self, config, target, &image, workspace)?;
        Ok(ImageArtifact {
            name: target.to_string(),
            backend: BackendKind::Vagrant,
            image,
            metadata,
        })
    }

    fn render_platform_information(&self, image: &ImageDescriptor) -> Vec<(String, String)> {
        [("image", &image.image), ("url", &image.url), ("arch", &image.arch)]
            .into_iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
            .collect()
    }
}
