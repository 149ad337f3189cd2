//! Lifecycle engine against an in-memory backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use twopence_config::{
    AnswerSet, Catalog, ImageDescriptor, InstanceConfig, PlannedStage, Purpose, RecipeAssembler,
    Resolver, StagePlan,
};
use twopence_curly::parse_str;
use twopence_topology::{
    BackendDriver, BackendError, BackendHandle, BackendKind, BackendResult, CreateOptions,
    ImageArtifact, InstanceRecord, InstanceState, ObservedInstance, Progress, StageOutcome,
    StartInfo, TopologyEngine, TopologyError, Workspace,
};

const TOPOLOGY: &str = r#"
testcase lifecycle;
platform leap-15.3 {
    vendor suse;
    os leap-15.3;
    features systemd;
    stage prep { run "zypper refresh"; }
    stage relabel { run "touch /.autorelabel"; reboot; }
    stage setup { only once; run "systemctl enable twopence-test-server"; }
    stage restart { run "true"; reboot; }
    stage verify { run "systemctl is-active twopence-test-server"; }
}
node client { platform leap-15.3; }
node server { platform leap-15.3; }
"#;

const SINGLE: &str = r#"
platform leap-15.3 {
    vendor suse;
    os leap-15.3;
    stage prep { run "zypper refresh"; }
}
node client { platform leap-15.3; }
"#;

/// Backend keeping instances in memory and logging every mutating call
#[derive(Debug, Default)]
struct FakeBackend {
    instances: Mutex<BTreeMap<String, InstanceState>>,
    calls: Mutex<Vec<String>>,
    fail_prepare: BTreeSet<String>,
    fail_stage: BTreeSet<(String, String)>,
}

impl FakeBackend {
    fn with_instances(instances: &[(&str, InstanceState)]) -> Self {
        let backend = Self::default();
        backend.instances.lock().unwrap().extend(
            instances
                .iter()
                .map(|(name, state)| ((*name).to_string(), *state)),
        );
        backend
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn set(&self, name: &str, state: InstanceState) {
        let _ = self.instances.lock().unwrap().insert(name.to_string(), state);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl BackendDriver for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Podman
    }

    async fn detect(&self, records: &[InstanceRecord]) -> BackendResult<Vec<ObservedInstance>> {
        let instances = self.instances.lock().unwrap();
        let mut names: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
        names.extend(instances.keys().map(String::as_str));
        Ok(names
            .into_iter()
            .map(|name| ObservedInstance {
                name: name.to_string(),
                state: instances.get(name).copied().unwrap_or_default(),
                handle: BackendHandle::new(),
            })
            .collect())
    }

    async fn prepare(
        &self,
        config: &InstanceConfig,
        _plan: &StagePlan,
        instance_dir: &Path,
    ) -> BackendResult<BackendHandle> {
        self.log(format!("prepare {}", config.name));
        if self.fail_prepare.contains(&config.name) {
            return Err(BackendError::NotFound(format!("image for {}", config.name)));
        }
        self.set(&config.name, InstanceState::Prepared);
        Ok(BackendHandle::from([(
            "dir".to_string(),
            instance_dir.display().to_string(),
        )]))
    }

    async fn start(&self, record: &InstanceRecord) -> BackendResult<StartInfo> {
        self.log(format!("start {}", record.name));
        self.set(&record.name, InstanceState::Running);
        Ok(StartInfo::reachable("10.88.0.5", None))
    }

    async fn run_stage(&self, record: &InstanceRecord, stage: &PlannedStage) -> BackendResult<StageOutcome> {
        self.log(format!("stage {} {}", record.name, stage.name));
        if self.fail_stage.contains(&(record.name.clone(), stage.name.clone())) {
            return Err(BackendError::CommandFailed {
                command: format!("stage {}", stage.name),
                code: Some(1),
                stderr: "Repository 'oss' is invalid".to_string(),
            });
        }
        Ok(if stage.reboot {
            StageOutcome::RebootRequired
        } else {
            StageOutcome::Completed
        })
    }

    async fn stop(&self, record: &InstanceRecord) -> BackendResult<()> {
        self.log(format!("stop {}", record.name));
        self.set(&record.name, InstanceState::Stopped);
        Ok(())
    }

    async fn destroy(&self, record: &InstanceRecord) -> BackendResult<()> {
        self.log(format!("destroy {}", record.name));
        let _ = self.instances.lock().unwrap().remove(&record.name);
        Ok(())
    }

    async fn package(
        &self,
        record: &InstanceRecord,
        _config: &InstanceConfig,
        target: &str,
        workspace: &Path,
    ) -> BackendResult<ImageArtifact> {
        self.log(format!("package {}", record.name));
        Ok(ImageArtifact {
            name: target.to_string(),
            backend: BackendKind::Podman,
            image: ImageDescriptor {
                backend: "podman".to_string(),
                image: Some(target.to_string()),
                registry: None,
                url: None,
                arch: None,
            },
            metadata: workspace.join(format!("{target}.platform")),
        })
    }

    fn render_platform_information(&self, image: &ImageDescriptor) -> Vec<(String, String)> {
        image
            .image
            .iter()
            .map(|name| ("image".to_string(), name.clone()))
            .collect()
    }
}

fn engine(dir: &TempDir, topology: &str, backend: FakeBackend) -> TopologyEngine<FakeBackend> {
    engine_for(dir, topology, Purpose::Testing, backend)
}

fn engine_for(
    dir: &TempDir,
    topology: &str,
    purpose: Purpose,
    backend: FakeBackend,
) -> TopologyEngine<FakeBackend> {
    let mut catalog = Catalog::new();
    catalog.absorb(&parse_str(topology).unwrap()).unwrap();
    let compiled = Resolver::new(&catalog)
        .compile(purpose, &AnswerSet::new())
        .unwrap();
    TopologyEngine::open(
        Workspace::new(dir.path()),
        backend,
        compiled,
        RecipeAssembler::default(),
    )
    .unwrap()
}

fn position(calls: &[String], call: &str) -> usize {
    calls.iter().position(|c| c == call).unwrap()
}

#[tokio::test]
async fn test_create_stops_at_reboot_checkpoint() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, TOPOLOGY, FakeBackend::default());

    let report = engine.create(CreateOptions::default()).await.unwrap();
    assert!(report.is_success());
    let pending: Vec<(&str, String)> = report
        .pending()
        .map(|(node, checkpoint)| (node, checkpoint.to_string()))
        .collect();
    assert_eq!(
        pending,
        vec![
            ("client", "stage 2 of 5 completed, reboot pending".to_string()),
            ("server", "stage 2 of 5 completed, reboot pending".to_string()),
        ]
    );

    let calls = engine.backend().calls();
    assert!(position(&calls, "prepare client") < position(&calls, "start client"));
    assert!(position(&calls, "start client") < position(&calls, "stage client prep"));
    assert!(position(&calls, "stage client prep") < position(&calls, "stage client relabel"));
    assert_eq!(engine.backend().count("stage client setup"), 0);

    let status = engine.status().await;
    let client = status.node("client").unwrap();
    assert_eq!(client.state, InstanceState::Running);
    assert_eq!(client.target.as_deref(), Some("tcp:10.88.0.5:4000"));
    assert_eq!(client.checkpoint.as_ref().unwrap().stage, "relabel");

    // The status file holds what the engine reported
    let saved = Workspace::new(dir.path())
        .load_status(BackendKind::Podman)
        .unwrap();
    assert_eq!(saved, status);
    assert_eq!(saved.testcase.as_deref(), Some("lifecycle"));
}

#[tokio::test]
async fn test_once_stage_runs_exactly_once_across_resumes() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, TOPOLOGY, FakeBackend::default());

    let _ = engine.create(CreateOptions::default()).await.unwrap();

    let first = engine.resume().await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.pending().count(), 2);
    let client = engine.status().await.node("client").cloned().unwrap();
    assert_eq!(client.checkpoint.as_ref().unwrap().stage, "restart");
    assert!(client.once_done.contains("setup"));

    let second = engine.resume().await.unwrap();
    assert!(
        second
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Ok(Progress::Completed)))
    );

    let backend = engine.backend();
    assert_eq!(backend.count("stage client setup"), 1);
    assert_eq!(backend.count("stage server setup"), 1);
    assert_eq!(backend.count("stage client verify"), 1);
    assert_eq!(backend.count("stage client prep"), 1);
    assert!(engine.status().await.node("client").unwrap().checkpoint.is_none());

    // Nothing left to resume
    let third = engine.resume().await.unwrap();
    assert!(third.outcomes.is_empty());
    assert_eq!(backend.count("stage client setup"), 1);
}

#[tokio::test]
async fn test_create_refuses_existing_instances() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::with_instances(&[
        ("client", InstanceState::Running),
        ("server", InstanceState::Stopped),
    ]);
    let engine = engine(&dir, TOPOLOGY, backend);

    let err = engine.create(CreateOptions::default()).await.unwrap_err();
    match err {
        TopologyError::InstancesExist(nodes) => assert_eq!(nodes, vec!["client", "server"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(engine.backend().calls().is_empty());

    // Detection recorded what the backend reported
    let status = engine.status().await;
    assert_eq!(status.node("client").unwrap().state, InstanceState::Running);
    assert_eq!(status.node("server").unwrap().state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_auto_destroy_stops_then_destroys_all() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::with_instances(&[
        ("client", InstanceState::Running),
        ("server", InstanceState::Running),
        ("stale", InstanceState::Running),
    ]);
    let engine = engine(&dir, TOPOLOGY, backend);

    let options = CreateOptions {
        auto_destroy: true,
        ..CreateOptions::default()
    };
    let report = engine.create(options).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.reconciliations.len(), 3);

    let calls = engine.backend().calls();
    for node in ["client", "server", "stale"] {
        let stop = position(&calls, &format!("stop {node}"));
        let destroy = position(&calls, &format!("destroy {node}"));
        assert!(stop < destroy, "{node}: {calls:?}");
        assert!(destroy < position(&calls, "prepare client"));
    }
    assert_eq!(engine.backend().count("stop "), 3);
    assert_eq!(engine.backend().count("destroy "), 3);

    let status = engine.status().await;
    assert!(status.node("stale").is_none());
    assert_eq!(status.node("server").unwrap().state, InstanceState::Running);
}

#[tokio::test]
async fn test_failures_are_collected_per_instance() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend {
        fail_prepare: BTreeSet::from(["server".to_string()]),
        ..FakeBackend::default()
    };
    let engine = engine(&dir, TOPOLOGY, backend);

    let report = engine.create(CreateOptions::default()).await.unwrap();
    assert!(!report.is_success());
    let failures: Vec<&str> = report.failures().map(|(node, _)| node).collect();
    assert_eq!(failures, vec!["server"]);
    assert_eq!(report.pending().count(), 1);

    let status = engine.status().await;
    assert_eq!(status.node("client").unwrap().state, InstanceState::Running);
    assert!(status.node("server").is_none());
    assert_eq!(engine.backend().count("start server"), 0);
}

#[tokio::test]
async fn test_failed_stage_stops_only_its_instance() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend {
        fail_stage: BTreeSet::from([("server".to_string(), "prep".to_string())]),
        ..FakeBackend::default()
    };
    let engine = engine(&dir, TOPOLOGY, backend);

    let report = engine.create(CreateOptions::default()).await.unwrap();
    let failures: Vec<&str> = report.failures().map(|(node, _)| node).collect();
    assert_eq!(failures, vec!["server"]);
    assert!(matches!(
        report.failures().next().unwrap().1,
        TopologyError::Backend(BackendError::CommandFailed { .. })
    ));

    // Nothing after the failed stage ran on server
    let backend = engine.backend();
    assert_eq!(backend.count("stage server "), 1);
    assert_eq!(backend.count("stage server relabel"), 0);

    // The sibling went on to its checkpoint
    assert_eq!(backend.count("stage client relabel"), 1);
    let pending: Vec<&str> = report.pending().map(|(node, _)| node).collect();
    assert_eq!(pending, vec!["client"]);

    // The failed instance stays in the last state it reached
    let saved = Workspace::new(dir.path())
        .load_status(BackendKind::Podman)
        .unwrap();
    let server = saved.node("server").unwrap();
    assert_eq!(server.state, InstanceState::Running);
    assert!(server.checkpoint.is_none());
    assert_eq!(saved.node("client").unwrap().checkpoint.as_ref().unwrap().stage, "relabel");
}

#[tokio::test]
async fn test_image_build_resumes_with_matching_digest() {
    let dir = TempDir::new().unwrap();
    let options = CreateOptions {
        image_build: true,
        ..CreateOptions::default()
    };
    {
        let engine = engine_for(&dir, TOPOLOGY, Purpose::Build, FakeBackend::default());
        let _ = engine.create(options).await.unwrap();
    }

    let saved = Workspace::new(dir.path())
        .load_status(BackendKind::Podman)
        .unwrap();
    assert!(saved.resumes_image_build());

    let mut catalog = Catalog::new();
    catalog.absorb(&parse_str(TOPOLOGY).unwrap()).unwrap();
    let resolver = Resolver::new(&catalog);
    let digest = |purpose| {
        resolver
            .compile(purpose, &AnswerSet::new())
            .unwrap()
            .node("client")
            .unwrap()
            .digest()
            .unwrap()
    };
    let recorded = saved.node("client").unwrap().config_digest.clone();
    assert_eq!(recorded, Some(digest(Purpose::Build)));
    assert_ne!(recorded, Some(digest(Purpose::Testing)));
}

#[tokio::test]
async fn test_resume_requires_running_instance() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, TOPOLOGY, FakeBackend::default());
    let _ = engine.create(CreateOptions::default()).await.unwrap();

    engine.backend().set("server", InstanceState::Stopped);
    let report = engine.resume().await.unwrap();
    assert_eq!(report.reconciliations.len(), 1);
    let failures: Vec<(&str, String)> = report
        .failures()
        .map(|(node, err)| (node, err.to_string()))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "server");
    assert!(matches!(
        report.outcomes.iter().find(|o| o.node == "server").unwrap().result,
        Err(TopologyError::ReconciliationMismatch { .. })
    ));
    assert_eq!(engine.backend().count("stage server setup"), 0);
    assert_eq!(engine.backend().count("stage client setup"), 1);
}

#[tokio::test]
async fn test_package_refused_without_exactly_one_instance() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, TOPOLOGY, FakeBackend::default());

    let err = engine.package(None, "leap-15.3-custom").await.unwrap_err();
    assert!(matches!(
        err,
        TopologyError::Backend(BackendError::PackageRefused { count: 0 })
    ));

    let _ = engine.create(CreateOptions::default()).await.unwrap();
    let err = engine.package(None, "leap-15.3-custom").await.unwrap_err();
    assert!(matches!(
        err,
        TopologyError::Backend(BackendError::PackageRefused { count: 2 })
    ));
    assert_eq!(engine.backend().count("package"), 0);
}

#[tokio::test]
async fn test_package_single_instance() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, SINGLE, FakeBackend::default());

    let report = engine.create(CreateOptions::default()).await.unwrap();
    assert!(matches!(report.outcomes[0].result, Ok(Progress::Completed)));

    let artifact = engine.package(Some("client"), "leap-15.3-custom").await.unwrap();
    assert_eq!(artifact.name, "leap-15.3-custom");
    assert_eq!(artifact.metadata, dir.path().join("leap-15.3-custom.platform"));

    let calls = engine.backend().calls();
    assert!(position(&calls, "stop client") < position(&calls, "package client"));
    assert_eq!(
        engine.status().await.node("client").unwrap().state,
        InstanceState::Packaged
    );

    // Packaged instances can still be destroyed
    let report = engine.destroy(false).await.unwrap();
    assert!(report.is_success());
    assert!(engine.status().await.nodes.is_empty());
}

#[tokio::test]
async fn test_stop_start_and_destroy_with_zap() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, SINGLE, FakeBackend::default());
    let _ = engine.create(CreateOptions::default()).await.unwrap();

    assert_eq!(engine.stop().await.unwrap(), vec!["client"]);
    let client = engine.status().await.node("client").cloned().unwrap();
    assert_eq!(client.state, InstanceState::Stopped);
    assert!(client.target.is_none());

    let report = engine.start().await.unwrap();
    assert!(matches!(report.outcomes[0].result, Ok(Progress::Started)));
    assert_eq!(engine.backend().count("start client"), 2);

    let workspace = Workspace::new(dir.path());
    assert!(workspace.status_path().exists());
    let report = engine.destroy(true).await.unwrap();
    assert!(report.is_success());
    let calls = engine.backend().calls();
    let last_stop = calls.iter().rposition(|c| c == "stop client").unwrap();
    assert!(last_stop < position(&calls, "destroy client"));
    assert!(!workspace.status_path().exists());
}

#[tokio::test]
async fn test_workspace_lock_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let _first = engine(&dir, SINGLE, FakeBackend::default());

    let mut catalog = Catalog::new();
    catalog.absorb(&parse_str(SINGLE).unwrap()).unwrap();
    let compiled = Resolver::new(&catalog)
        .compile(Purpose::Testing, &AnswerSet::new())
        .unwrap();
    let second = TopologyEngine::open(
        Workspace::new(PathBuf::from(dir.path())),
        FakeBackend::default(),
        compiled,
        RecipeAssembler::default(),
    );
    assert!(matches!(second, Err(TopologyError::WorkspaceBusy(_))));
}
