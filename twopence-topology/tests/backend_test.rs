//! Command sequences the backends issue, checked against a scripted runner.

use async_trait::async_trait;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use twopence_config::{
    AnswerSet, Catalog, CompiledConfig, Purpose, RecipeAssembler, Resolver, RunContext,
};
use twopence_curly::parse_str;
use twopence_topology::{
    Backend, BackendDriver, BackendError, BackendKind, BackendResult, CommandOutput,
    CommandRunner, CreateOptions, HostCommand, InstanceState, NodeStatus, StageOutcome,
    TopologyEngine, TopologyError, Workspace,
};

const PODMAN_TOPOLOGY: &str = r#"
testcase demo;
platform leap-15.3 {
    vendor suse;
    os leap-15.3;
    arch x86_64;
    features systemd;
    backend podman { image "leap:15.3"; registry registry.opensuse.org; }
    stage prep { run "zypper --non-interactive refresh"; }
}
node client { platform leap-15.3; }
"#;

const VAGRANT_TOPOLOGY: &str = r#"
platform leap-15.3 {
    vendor suse;
    os leap-15.3;
    features systemd;
    repository oss { url "http://download.opensuse.org/distribution/leap/15.3/repo/oss"; }
    backend vagrant { image "opensuse/Leap-15.3.x86_64"; }
    stage relabel { run "touch /.autorelabel"; reboot; }
}
node server {
    platform leap-15.3;
    repositories oss;
    install twopence-test-server;
    start twopence-test-server;
}
"#;

const INSPECT: &str = r#"[{
    "State": {"Pid": 3117, "Status": "running"},
    "NetworkSettings": {"Networks": {"podman": {"IPAddress": "10.88.0.7", "IPPrefixLen": 16}}}
}]"#;

/// Runner answering by command prefix and remembering what it ran
#[derive(Debug, Default)]
struct ScriptedRunner {
    responses: Vec<(String, CommandOutput)>,
    commands: Mutex<Vec<HostCommand>>,
}

impl ScriptedRunner {
    fn new(responses: &[(&str, CommandOutput)]) -> Arc<Self> {
        Arc::new(Self {
            responses: responses
                .iter()
                .map(|(prefix, output)| ((*prefix).to_string(), output.clone()))
                .collect(),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &HostCommand) -> BackendResult<CommandOutput> {
        let line = command.to_string();
        self.commands.lock().unwrap().push(command.clone());
        Ok(self
            .responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map_or_else(|| CommandOutput::ok(""), |(_, output)| output.clone()))
    }
}

fn compile(topology: &str) -> CompiledConfig {
    let mut catalog = Catalog::new();
    catalog.absorb(&parse_str(topology).unwrap()).unwrap();
    Resolver::new(&catalog)
        .compile(Purpose::Testing, &AnswerSet::new())
        .unwrap()
}

#[tokio::test]
async fn test_podman_lifecycle_commands() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[("podman inspect", CommandOutput::ok(INSPECT))]);
    let backend = Backend::new(BackendKind::Podman, None, Some("demo"), runner.clone()).unwrap();

    let compiled = compile(PODMAN_TOPOLOGY);
    let config = compiled.node("client").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();

    let instance_dir = dir.path().join("client");
    let mut record = NodeStatus::for_config(config, false).unwrap();
    record.handle = backend.prepare(config, &plan, &instance_dir).await.unwrap();
    assert_eq!(record.handle("container"), Some("twopence-demo-client"));
    assert_eq!(record.handle("image"), Some("registry.opensuse.org/leap:15.3"));
    assert!(instance_dir.join("provision").is_dir());

    let info = backend.start(&record).await.unwrap();
    assert_eq!(info.target.as_deref(), Some("tcp:10.88.0.7:4000"));
    assert_eq!(info.interfaces[0].prefix_len, 16);
    assert_eq!(info.handle.get("pid").map(String::as_str), Some("3117"));

    let outcome = backend.run_stage(&record, &plan.stages[0]).await.unwrap();
    assert_eq!(outcome, StageOutcome::Completed);
    backend.stop(&record).await.unwrap();

    let artifact = backend
        .package(&record, config, "leap-15.3-custom", dir.path())
        .await
        .unwrap();
    let metadata = fs::read_to_string(&artifact.metadata).unwrap();
    assert!(metadata.contains("platform leap-15.3-custom"));
    assert!(metadata.contains("base-platform leap-15.3;"));
    assert!(metadata.contains("backend podman"));

    backend.destroy(&record).await.unwrap();
    assert!(!instance_dir.exists());

    let volume = format!(
        "{}:/usr/lib/twopence/provision:ro,Z",
        instance_dir.join("provision").display()
    );
    assert_eq!(
        runner.lines(),
        vec![
            "podman image exists registry.opensuse.org/leap:15.3".to_string(),
            format!(
                "podman create --name twopence-demo-client --hostname client --volume {volume} registry.opensuse.org/leap:15.3 /usr/sbin/init"
            ),
            "podman start twopence-demo-client".to_string(),
            "podman inspect --format json twopence-demo-client".to_string(),
            r#"podman exec twopence-demo-client sh -c "zypper --non-interactive refresh""#.to_string(),
            "podman stop twopence-demo-client".to_string(),
            "podman commit twopence-demo-client leap-15.3-custom".to_string(),
            "podman rm -f --ignore twopence-demo-client".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_podman_pulls_missing_image_and_detects_containers() {
    let dir = TempDir::new().unwrap();
    let ps = r#"[{"Names": ["twopence-demo-client"], "State": "exited", "Id": "4b1d"}]"#;
    let runner = ScriptedRunner::new(&[
        ("podman image exists", CommandOutput::failed(1, "")),
        ("podman ps", CommandOutput::ok(ps)),
    ]);
    let backend = Backend::new(BackendKind::Podman, None, Some("demo"), runner.clone()).unwrap();

    let compiled = compile(PODMAN_TOPOLOGY);
    let config = compiled.node("client").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();
    let _ = backend
        .prepare(config, &plan, &dir.path().join("client"))
        .await
        .unwrap();
    assert_eq!(runner.lines()[1], "podman pull registry.opensuse.org/leap:15.3");

    let observed = backend
        .detect(&[NodeStatus::unknown("client"), NodeStatus::unknown("server")])
        .await
        .unwrap();
    assert_eq!(observed[0].state, twopence_topology::InstanceState::Stopped);
    assert_eq!(observed[0].handle.get("id").map(String::as_str), Some("4b1d"));
    assert_eq!(observed[1].state, twopence_topology::InstanceState::Absent);
}

#[tokio::test]
async fn test_podman_refuses_reboot_stages() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[]);
    let backend = Backend::new(BackendKind::Podman, None, Some("demo"), runner.clone()).unwrap();

    let compiled = compile(&PODMAN_TOPOLOGY.replace(
        "stage prep {",
        "stage relabel { run \"touch /.autorelabel\"; reboot; }\n    stage prep {",
    ));
    let config = compiled.node("client").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();

    let err = backend
        .prepare(config, &plan, &dir.path().join("client"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { backend: "podman", .. }));
    assert!(runner.lines().is_empty());
}

#[tokio::test]
async fn test_podman_name_clash_is_instance_exists() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[(
        "podman create",
        CommandOutput::failed(125, "Error: the container name \"twopence-demo-client\" is already in use"),
    )]);
    let backend = Backend::new(BackendKind::Podman, None, Some("demo"), runner).unwrap();

    let compiled = compile(PODMAN_TOPOLOGY);
    let config = compiled.node("client").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();
    let err = backend
        .prepare(config, &plan, &dir.path().join("client"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InstanceExists(name) if name == "twopence-demo-client"));
}

#[tokio::test]
async fn test_vagrant_lifecycle_commands() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[
        (
            "vagrant up",
            CommandOutput::ok("    default: SSH address: 192.168.121.57:22\n"),
        ),
        (
            "vagrant status",
            CommandOutput::ok("1700000000,default,state,running\n"),
        ),
        (
            "vagrant ssh -c \"sudo systemctl reboot\"",
            CommandOutput::failed(255, "Connection to 192.168.121.57 closed by remote host."),
        ),
    ]);
    let backend = Backend::new(BackendKind::Vagrant, None, None, runner.clone()).unwrap();

    let compiled = compile(VAGRANT_TOPOLOGY);
    let config = compiled.node("server").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();

    let instance_dir = dir.path().join("server");
    let mut record = NodeStatus::for_config(config, false).unwrap();
    record.handle = backend.prepare(config, &plan, &instance_dir).await.unwrap();
    assert_eq!(record.handle("provision"), Some("/vagrant/provision"));

    let vagrantfile = fs::read_to_string(instance_dir.join("Vagrantfile")).unwrap();
    assert!(vagrantfile.contains(r#"config.vm.box = "opensuse/Leap-15.3.x86_64""#));
    assert!(vagrantfile.contains(r#"config.vm.hostname = "server""#));
    assert!(vagrantfile.contains("zypper --non-interactive addrepo --refresh"));
    assert!(vagrantfile.contains("zypper --non-interactive install twopence-test-server"));
    assert!(vagrantfile.contains("systemctl enable --now twopence-test-server"));
    assert!(!vagrantfile.contains("box_url"));
    assert!(!vagrantfile.contains("private_key_path"));

    // A second prepare must not clobber the instance
    assert!(matches!(
        backend.prepare(config, &plan, &instance_dir).await,
        Err(BackendError::InstanceExists(_))
    ));

    let observed = backend.detect(std::slice::from_ref(&record)).await.unwrap();
    assert_eq!(observed[0].state, twopence_topology::InstanceState::Running);

    let info = backend.start(&record).await.unwrap();
    assert_eq!(info.target.as_deref(), Some("tcp:192.168.121.57:4000"));

    let outcome = backend.run_stage(&record, &plan.stages[0]).await.unwrap();
    assert_eq!(outcome, StageOutcome::RebootRequired);

    backend.destroy(&record).await.unwrap();
    assert!(!instance_dir.exists());

    assert_eq!(
        runner.lines(),
        vec![
            "vagrant status --machine-readable",
            "vagrant up",
            r#"vagrant ssh -c "sudo sh -c 'touch /.autorelabel'""#,
            r#"vagrant ssh -c "sudo systemctl reboot""#,
            "vagrant destroy -f",
        ]
    );
    let commands = runner.commands.lock().unwrap();
    assert!(commands.iter().all(|c| c.cwd.as_deref() == Some(instance_dir.as_path())));
}

#[tokio::test]
async fn test_vagrant_failed_step_is_reported() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[(
        "vagrant ssh",
        CommandOutput::failed(1, "touch: cannot touch '/.autorelabel': Read-only file system"),
    )]);
    let backend = Backend::new(BackendKind::Vagrant, None, None, runner).unwrap();

    let compiled = compile(VAGRANT_TOPOLOGY);
    let config = compiled.node("server").unwrap();
    let plan = RecipeAssembler::default()
        .assemble(config, &RunContext::default())
        .unwrap();
    let mut record = NodeStatus::for_config(config, false).unwrap();
    record.handle = backend
        .prepare(config, &plan, &dir.path().join("server"))
        .await
        .unwrap();

    match backend.run_stage(&record, &plan.stages[0]).await {
        Err(BackendError::CommandFailed { code, stderr, .. }) => {
            assert_eq!(code, Some(1));
            assert!(stderr.contains("Read-only file system"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_vagrant_box_never_brought_up_can_be_destroyed() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(&[
        (
            "vagrant up",
            CommandOutput::failed(1, "Error while activating network: Call to virNetworkCreate failed"),
        ),
        (
            "vagrant status",
            CommandOutput::ok("1700000000,default,state,not_created\n"),
        ),
    ]);
    let backend = Backend::new(BackendKind::Vagrant, None, None, runner.clone()).unwrap();
    let engine = TopologyEngine::open(
        Workspace::new(dir.path()),
        backend,
        compile(VAGRANT_TOPOLOGY),
        RecipeAssembler::default(),
    )
    .unwrap();

    let report = engine.create(CreateOptions::default()).await.unwrap();
    assert_eq!(report.failures().count(), 1);
    let instance_dir = Workspace::new(dir.path()).node_dir("server");
    assert!(instance_dir.join("Vagrantfile").is_file());
    assert_eq!(engine.status().await.node("server").unwrap().state, InstanceState::Prepared);

    // A Vagrantfile without a box is still the prepared instance
    let reconciliations = engine.detect().await.unwrap();
    assert!(reconciliations.is_empty(), "{reconciliations:?}");
    assert_eq!(engine.status().await.node("server").unwrap().state, InstanceState::Prepared);

    let destroyed = engine.destroy(false).await.unwrap();
    assert!(destroyed.is_success());
    assert_eq!(destroyed.outcomes.len(), 1);
    assert!(!instance_dir.exists());
    assert!(runner.lines().iter().any(|line| line == "vagrant destroy -f"));

    // The workspace is usable again
    let again = engine.create(CreateOptions::default()).await.unwrap();
    let (node, err) = again.failures().next().unwrap();
    assert_eq!(node, "server");
    assert!(!matches!(err, TopologyError::Backend(BackendError::InstanceExists(_))), "{err}");
    assert!(instance_dir.join("Vagrantfile").is_file());
}
