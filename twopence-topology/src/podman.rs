//! Podman containers as test instances

use crate::backend::{
    BackendDriver, BackendHandle, BackendKind, ImageArtifact, InstanceRecord, ObservedInstance,
    Settings, StageOutcome, StartInfo, instance_dir, stage_scripts, write_platform_metadata,
};
use crate::error::{BackendError, BackendResult};
use crate::runner::{CommandRunner, HostCommand};
use crate::state::InstanceState;
use crate::store::NetworkInterface;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use twopence_config::{ImageDescriptor, InstanceConfig, PlannedStage, StagePlan};

/// Mount point of the shell library inside containers
const PROVISION_DIR: &str = "/usr/lib/twopence/provision";

/// Podman backend
#[derive(Debug)]
pub struct PodmanBackend {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
    testcase: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    id: String,
}

impl PodmanBackend {
    /// Backend running `podman` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings, testcase: Option<&str>) -> Self {
        Self {
            runner,
            settings,
            testcase: testcase.unwrap_or("default").to_string(),
        }
    }

    /// `twopence-<testcase>-<node>`
    #[must_use]
    pub fn container_name(&self, node: &str) -> String {
        format!("twopence-{}-{node}", self.testcase)
    }

    fn podman<I, S>(&self, args: I) -> HostCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = HostCommand::new("podman").args(args);
        match self.settings.timeout {
            Some(timeout) => command.timeout(timeout),
            None => command,
        }
    }

    fn container(&self, record: &InstanceRecord) -> String {
        record
            .handle("container")
            .map_or_else(|| self.container_name(&record.name), str::to_string)
    }

    async fn ensure_image(&self, image: &str) -> BackendResult<()> {
        let exists = self.runner.run(&self.podman(["image", "exists", image])).await?;
        if exists.success() {
            return Ok(());
        }
        info!("Pulling {image}");
        let _ = self.runner.run_checked(&self.podman(["pull", image])).await?;
        Ok(())
    }
}

/// Map podman's container state onto the lifecycle.
pub fn parse_container_state(state: &str) -> InstanceState {
    match state.to_ascii_lowercase().as_str() {
        "running" | "paused" => InstanceState::Running,
        "created" | "configured" | "initialized" => InstanceState::Prepared,
        _ => InstanceState::Stopped,
    }
}

/// Pid and addresses from `podman inspect` output.
///
/// # Errors
///
/// Output that is not a JSON array of containers.
pub fn parse_inspect(output: &str) -> BackendResult<(Option<i64>, Vec<NetworkInterface>)> {
    let value: Value = serde_json::from_str(output)?;
    let Some(container) = value.as_array().and_then(|list| list.first()) else {
        return Ok((None, Vec::new()));
    };

    let pid = container
        .pointer("/State/Pid")
        .and_then(Value::as_i64)
        .filter(|pid| *pid > 0);

    let mut interfaces = Vec::new();
    let mut add = |settings: &Value| {
        let prefix = |key: &str| {
            settings
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|len| u8::try_from(len).ok())
                .filter(|len| *len > 0)
        };
        if let Some(address) = settings.get("IPAddress").and_then(Value::as_str)
            && !address.is_empty()
        {
            interfaces.push(NetworkInterface::from_address(address, prefix("IPPrefixLen")));
        }
        if let Some(address) = settings.get("GlobalIPv6Address").and_then(Value::as_str)
            && !address.is_empty()
        {
            interfaces.push(NetworkInterface::from_address(
                address,
                prefix("GlobalIPv6PrefixLen"),
            ));
        }
    };

    let networks = container
        .pointer("/NetworkSettings/Networks")
        .and_then(Value::as_object);
    match networks {
        Some(networks) if !networks.is_empty() => networks.values().for_each(&mut add),
        _ => {
            if let Some(settings) = container.get("NetworkSettings") {
                add(settings);
            }
        }
    }
    Ok((pid, interfaces))
}

#[async_trait]
impl BackendDriver for PodmanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Podman
    }

    async fn detect(&self, records: &[InstanceRecord]) -> BackendResult<Vec<ObservedInstance>> {
        let filter = format!("name=twopence-{}-", self.testcase);
        let command = self.podman(["ps", "-a", "--format", "json", "--filter", filter.as_str()]);
        let output = self.runner.run_checked(&command).await?;
        let entries: Vec<PsEntry> = if output.stdout.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&output.stdout)?
        };

        Ok(records
            .iter()
            .map(|record| {
                let name = self.container(record);
                match entries.iter().find(|entry| entry.names.contains(&name)) {
                    Some(entry) => {
                        let mut handle = BackendHandle::new();
                        if !entry.id.is_empty() {
                            let _ = handle.insert("id".to_string(), entry.id.clone());
                        }
                        let state = parse_container_state(&entry.state);
                        debug!("{}: container {name} is {}", record.name, entry.state);
                        ObservedInstance {
                            name: record.name.clone(),
                            state,
                            handle,
                        }
                    }
                    None => ObservedInstance::absent(&record.name),
                }
            })
            .collect())
    }

    async fn prepare(
        &self,
        config: &InstanceConfig,
        plan: &StagePlan,
        instance_dir: &Path,
    ) -> BackendResult<BackendHandle> {
        if let Some(stage) = plan.stages.iter().find(|stage| stage.reboot) {
            return Err(BackendError::Unsupported {
                backend: "podman",
                what: format!("stage {} of {} needs a reboot", stage.name, config.name),
            });
        }

        let descriptor = config.image_for("podman");
        let image = descriptor
            .and_then(|d| d.image.as_deref())
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "podman image for platform {}",
                    config.base_platform().unwrap_or("?")
                ))
            })?;
        let image = match descriptor.and_then(|d| d.registry.as_deref()) {
            Some(registry) => format!("{}/{image}", registry.trim_end_matches('/')),
            None => image.to_string(),
        };
        self.ensure_image(&image).await?;

        fs::create_dir_all(instance_dir).map_err(BackendError::io(instance_dir))?;
        let scripts = stage_scripts(plan, instance_dir)?;

        let container = self.container_name(&config.name);
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            container.clone(),
            "--hostname".to_string(),
            config.name.clone(),
            "--volume".to_string(),
            format!("{}:{PROVISION_DIR}:ro,Z", scripts.display()),
        ];
        if let Some(network) = &self.settings.network {
            args.push(format!("--network={network}"));
        }
        args.push(image.clone());
        if config.features.contains("systemd") {
            args.push("/usr/sbin/init".to_string());
        } else {
            args.extend(["sleep".to_string(), "infinity".to_string()]);
        }

        let output = self.runner.run(&self.podman(args.clone())).await?;
        if !output.success() {
            if output.stderr.contains("already in use") {
                return Err(BackendError::InstanceExists(container));
            }
            let _ = output.check(&self.podman(args))?;
        }

        let mut handle = BackendHandle::new();
        let _ = handle.insert("dir".to_string(), instance_dir.display().to_string());
        let _ = handle.insert("container".to_string(), container);
        let _ = handle.insert("image".to_string(), image);
        Ok(handle)
    }

    async fn start(&self, record: &InstanceRecord) -> BackendResult<StartInfo> {
        let container = self.container(record);
        let _ = self.runner.run_checked(&self.podman(["start", container.as_str()])).await?;

        let inspect = self
            .runner
            .run_checked(&self.podman(["inspect", "--format", "json", container.as_str()]))
            .await?;
        let (pid, interfaces) = parse_inspect(&inspect.stdout)?;

        let mut info = StartInfo {
            target: interfaces.first().map(|i| crate::backend::target_for(&i.address)),
            interfaces,
            ..StartInfo::default()
        };
        if let Some(pid) = pid {
            let _ = info.handle.insert("pid".to_string(), pid.to_string());
        }
        info!("{}: container {container} started", record.name);
        Ok(info)
    }

    async fn run_stage(&self, record: &InstanceRecord, stage: &PlannedStage) -> BackendResult<StageOutcome> {
        if stage.reboot {
            return Err(BackendError::Unsupported {
                backend: "podman",
                what: format!("reboot in stage {}", stage.name),
            });
        }
        let container = self.container(record);
        for step in &stage.steps {
            let line = step.shell_line(PROVISION_DIR);
            let command = self.podman(["exec", container.as_str(), "sh", "-c", line.as_str()]);
            let _ = self.runner.run_checked(&command).await?;
        }
        Ok(StageOutcome::Completed)
    }

    async fn stop(&self, record: &InstanceRecord) -> BackendResult<()> {
        let container = self.container(record);
        let _ = self.runner.run_checked(&self.podman(["stop", container.as_str()])).await?;
        Ok(())
    }

    async fn destroy(&self, record: &InstanceRecord) -> BackendResult<()> {
        let container = self.container(record);
        let _ = self
            .runner
            .run_checked(&self.podman(["rm", "-f", "--ignore", container.as_str()]))
            .await?;
        if let Ok(dir) = instance_dir(record) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(BackendError::io(&dir)(err)),
            }
        }
        Ok(())
    }

    async fn package(
        &self,
        record: &InstanceRecord,
        config: &InstanceConfig,
        target: &str,
        workspace: &Path,
    ) -> BackendResult<ImageArtifact> {
        let container = self.container(record);
        let _ = self
            .runner
            .run_checked(&self.podman(["commit", container.as_str(), target]))
            .await?;

        let image = ImageDescriptor {
            backend: BackendKind::Podman.name().to_string(),
            image: Some(target.to_string()),
            registry: None,
            url: None,
            arch: config.arch.clone(),
        };
        let metadata = write_platform_metadata(self, config, target, &image, workspace)?;
        Ok(ImageArtifact {
            name: target.to_string(),
            backend: BackendKind::Podman,
            image,
            metadata,
        })
    }

    fn render_platform_information(&self, image: &ImageDescriptor) -> Vec<(String, String)> {
        [("image", &image.image), ("registry", &image.registry), ("arch", &image.arch)]
            .into_iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AddressFamily;

    #[test]
    fn test_container_state() {
        assert_eq!(parse_container_state("running"), InstanceState::Running);
        assert_eq!(parse_container_state("Created"), InstanceState::Prepared);
        assert_eq!(parse_container_state("exited"), InstanceState::Stopped);
    }

    #[test]
    fn test_inspect_networks() {
        let output = r#"[{
            "State": {"Pid": 4242, "Status": "running"},
            "NetworkSettings": {
                "IPAddress": "",
                "Networks": {
                    "podman": {"IPAddress": "10.88.0.7", "IPPrefixLen": 16, "GlobalIPv6Address": "fd00::7", "GlobalIPv6PrefixLen": 0}
                }
            }
        }]"#;
        let (pid, interfaces) = parse_inspect(output).unwrap();
        assert_eq!(pid, Some(4242));
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].address, "10.88.0.7");
        assert_eq!(interfaces[0].prefix_len, 16);
        assert_eq!(interfaces[1].family, AddressFamily::Ipv6);
        assert_eq!(interfaces[1].prefix_len, 64);
    }

    #[test]
    fn test_inspect_stopped_container() {
        let output = r#"[{"State": {"Pid": 0}, "NetworkSettings": {"IPAddress": ""}}]"#;
        let (pid, interfaces) = parse_inspect(output).unwrap();
        assert_eq!(pid, None);
        assert!(interfaces.is_empty());
        assert!(parse_inspect("not json").is_err());
    }
}
