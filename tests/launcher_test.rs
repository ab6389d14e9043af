use service_launcher::config::Config;
use service_launcher::dispatcher::StatusReceiver;
use service_launcher::error::{ErrorKind, LauncherError};
use service_launcher::launcher::Launcher;
use service_launcher::mock::{MockProvider, MockRegistry, MockRuntime, RuntimeCall};
use service_launcher::model::{
    Action, ServiceInfo, ServiceState, ServiceStatus, StatusEvent, UserSet,
};
use service_launcher::registry::{MemoryRegistry, Registry, SqliteRegistry};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    config: Config,
    launcher: Launcher,
    status: StatusReceiver,
    registry: Arc<dyn Registry>,
    provider: Arc<MockProvider>,
    runtime: Arc<MockRuntime>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::build(dir, Arc::new(MemoryRegistry::new()))
    }

    async fn sqlite() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = SqliteRegistry::open(dir.path().join("servicemanager.db"))
            .await
            .unwrap();
        Self::build(dir, Arc::new(registry))
    }

    async fn mock_registry() -> (Self, Arc<MockRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MockRegistry::new());
        (Self::build(dir, registry.clone()), registry)
    }

    /// Closes the launcher and builds a new one on the same SQLite file, with
    /// a runtime that has nothing running.
    async fn restart(self) -> Self {
        let Harness {
            _dir: dir,
            launcher,
            registry,
            ..
        } = self;
        launcher.close().await;
        drop(registry);

        let registry = SqliteRegistry::open(dir.path().join("servicemanager.db"))
            .await
            .unwrap();
        Self::build(dir, Arc::new(registry))
    }

    fn build(dir: tempfile::TempDir, registry: Arc<dyn Registry>) -> Self {
        let config = Config::with_working_dir(dir.path());
        let provider = Arc::new(MockProvider::new(dir.path().join("remote")));
        let runtime = Arc::new(MockRuntime::new());
        let (launcher, status) =
            Launcher::new(&config, registry.clone(), provider.clone(), runtime.clone());
        Self {
            _dir: dir,
            config,
            launcher,
            status,
            registry,
            provider,
            runtime,
        }
    }

    async fn next_event(&mut self) -> StatusEvent {
        tokio::time::timeout(Duration::from_secs(10), self.status.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("status channel closed")
    }

    /// Installs and waits for the outcome.
    async fn install(&mut self, info: ServiceInfo) -> StatusEvent {
        self.launcher.install(info).unwrap();
        self.next_event().await
    }

    async fn remove(&mut self, id: &str) -> StatusEvent {
        self.launcher.remove(id).unwrap();
        self.next_event().await
    }

    async fn state(&self, id: &str) -> ServiceState {
        self.registry.service(id).await.unwrap().state
    }
}

#[tokio::test]
async fn test_install_then_remove_subset() {
    let mut h = Harness::new().await;
    h.launcher.set_users(UserSet::new(["user1"])).await.unwrap();

    for i in 0..5 {
        h.launcher
            .install(ServiceInfo::new(format!("service{i}"), 0))
            .unwrap();
    }
    for _ in 0..5 {
        let event = h.next_event().await;
        assert_eq!(event.action, Action::Install);
        assert!(event.is_ok(), "install failed: {:?}", event.error);
    }

    for i in 0..2 {
        let event = h.remove(&format!("service{i}")).await;
        assert_eq!(event.action, Action::Remove);
        assert!(event.is_ok());
    }

    let services = h.launcher.services().await.unwrap();
    assert_eq!(services.len(), 3);
    assert!(services.iter().all(|s| s.status == ServiceStatus::Ok));
    assert_eq!(h.runtime.running(), vec!["service2", "service3", "service4"]);
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let mut h = Harness::new().await;

    assert!(h.install(ServiceInfo::new("svc-a", 5)).await.is_ok());

    let event = h.install(ServiceInfo::new("svc-a", 4)).await;
    let error = event.error.expect("stale install must fail");
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(event.version, 4);
    assert_eq!(h.registry.service("svc-a").await.unwrap().version, 5);

    let event = h.install(ServiceInfo::new("svc-a", 5)).await;
    assert_eq!(event.error.map(|e| e.kind()), Some(ErrorKind::Conflict));

    assert!(h.install(ServiceInfo::new("svc-a", 6)).await.is_ok());
    let record = h.registry.service("svc-a").await.unwrap();
    assert_eq!(record.version, 6);
    assert_eq!(record.status, ServiceStatus::Ok);
    assert_eq!(h.registry.services().await.unwrap().len(), 1);
    assert_eq!(h.provider.fetches("svc-a"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_id_requests_are_serialized() {
    let mut h = Harness::new().await;
    h.provider.set_delay(Duration::from_millis(5));

    h.launcher.install(ServiceInfo::new("svc0", 1)).unwrap();
    h.launcher.remove("svc0").unwrap();
    h.launcher.install(ServiceInfo::new("svc0", 2)).unwrap();
    h.launcher.install(ServiceInfo::new("svc0", 2)).unwrap();
    h.launcher.remove("svc0").unwrap();
    h.launcher.install(ServiceInfo::new("svc0", 3)).unwrap();

    let mut seen = Vec::new();
    for _ in 0..6 {
        let event = h.next_event().await;
        seen.push((event.action, event.version, event.is_ok()));
    }
    assert_eq!(
        seen,
        vec![
            (Action::Install, 1, true),
            (Action::Remove, 1, true),
            (Action::Install, 2, true),
            (Action::Install, 2, false),
            (Action::Remove, 2, true),
            (Action::Install, 3, true),
        ]
    );

    assert_eq!(h.provider.max_in_flight("svc0"), 1);
    assert_eq!(h.registry.service("svc0").await.unwrap().version, 3);
}

#[tokio::test]
async fn test_user_switch_keeps_bundles() {
    let mut h = Harness::new().await;
    let u1 = UserSet::new(["u1"]);
    let u2 = UserSet::new(["u2"]);

    h.launcher.set_users(u1.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("svc-a", 0)).await.is_ok());

    let report = h.launcher.set_users(u2.clone()).await.unwrap();
    assert_eq!(report.stopped, 1);
    assert_eq!(h.state("svc-a").await, ServiceState::Stopped);
    assert!(!h.runtime.is_running("svc-a"));
    assert_eq!(h.launcher.services().await.unwrap().len(), 1);

    let report = h.launcher.set_users(u1).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(h.state("svc-a").await, ServiceState::Running);
    assert!(h.runtime.is_running("svc-a"));
    assert_eq!(h.provider.fetches("svc-a"), 1);
}

#[tokio::test]
async fn test_each_user_set_sees_only_its_services() {
    let mut h = Harness::new().await;
    let u1 = UserSet::new(["user1"]);
    let u2 = UserSet::new(["user2"]);

    h.launcher.set_users(u1.clone()).await.unwrap();
    for id in ["a0", "a1"] {
        assert!(h.install(ServiceInfo::new(id, 0)).await.is_ok());
    }
    h.launcher.set_users(u2.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("b0", 0)).await.is_ok());

    assert_eq!(h.runtime.running(), vec!["b0"]);
    assert_eq!(h.registry.users_services(&u1).await.unwrap().len(), 2);
    assert_eq!(h.registry.users_services(&u2).await.unwrap().len(), 1);

    h.launcher.set_users(u1).await.unwrap();
    assert_eq!(h.runtime.running(), vec!["a0", "a1"]);
    assert_eq!(h.state("b0").await, ServiceState::Stopped);
}

#[tokio::test]
async fn test_expired_service_is_reclaimed_with_its_users() {
    let mut h = Harness::sqlite().await;
    let u1 = UserSet::new(["u1"]);
    let u2 = UserSet::new(["u2"]);

    h.launcher.set_users(u2.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("old", 0)).await.is_ok());
    h.launcher.set_users(u1.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("fresh", 0)).await.is_ok());

    let past = chrono::Utc::now() - chrono::Duration::days(31);
    h.registry.set_service_start_time("old", past).await.unwrap();

    let report = h.launcher.set_users(u1.clone()).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.purged, vec![u2]);

    assert!(h.registry.find_service("old").await.unwrap().is_none());
    assert!(!h.config.services_dir().join("old_v0").exists());
    assert_eq!(h.registry.users_list().await.unwrap(), vec![u1]);
    assert_eq!(h.state("fresh").await, ServiceState::Running);
}

#[tokio::test]
async fn test_all_expired_leaves_empty_registry() {
    let mut h = Harness::sqlite().await;
    let users = UserSet::new(["user1"]);
    h.launcher.set_users(users.clone()).await.unwrap();

    for i in 0..3 {
        let info = ServiceInfo::new(format!("service{i}"), 0).with_ttl_days(30);
        assert!(h.install(info).await.is_ok());
    }
    let past = chrono::Utc::now() - chrono::Duration::days(30) - chrono::Duration::seconds(1);
    for i in 0..3 {
        h.registry
            .set_service_start_time(&format!("service{i}"), past)
            .await
            .unwrap();
    }

    h.launcher.set_users(users).await.unwrap();
    assert!(h.registry.services().await.unwrap().is_empty());
    assert!(h.registry.users_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_all_reloads_once() {
    let mut h = Harness::new().await;
    h.launcher.set_users(UserSet::new(["u1"])).await.unwrap();
    for i in 0..4 {
        assert!(h.install(ServiceInfo::new(format!("svc{i}"), 0)).await.is_ok());
    }
    h.launcher.set_users(UserSet::new(["u2"])).await.unwrap();
    assert!(h.install(ServiceInfo::new("svc4", 0)).await.is_ok());

    let reloads = h.runtime.reloads();
    h.launcher.remove_all().await.unwrap();

    assert_eq!(h.runtime.reloads() - reloads, 1);
    assert!(h.registry.services().await.unwrap().is_empty());
    assert!(h.registry.users_list().await.unwrap().is_empty());
    assert!(h.runtime.running().is_empty());
    assert!(h.status.try_recv().is_err(), "bulk removal publishes no events");
}

#[tokio::test]
async fn test_failed_install_leaves_no_record() {
    let mut h = Harness::new().await;
    h.provider.fail("broken");
    h.runtime.fail_start("crashing");

    let event = h.install(ServiceInfo::new("broken", 1)).await;
    assert_eq!(event.error.map(|e| e.kind()), Some(ErrorKind::ProviderFailure));

    let event = h.install(ServiceInfo::new("crashing", 1)).await;
    assert_eq!(event.error.map(|e| e.kind()), Some(ErrorKind::RuntimeFailure));
    assert!(h
        .runtime
        .calls()
        .contains(&RuntimeCall::Unregister("crashing".into())));

    assert!(h.launcher.services().await.unwrap().is_empty());
    assert!(!h.config.services_dir().join("crashing_v1").exists());
    assert!(h.registry.users_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_unknown_service_succeeds() {
    let mut h = Harness::new().await;

    let event = h.remove("ghost").await;
    assert_eq!(event.id, "ghost");
    assert_eq!(event.action, Action::Remove);
    assert!(event.is_ok());
    assert!(h.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_permissions_are_stored_and_configured() {
    let mut h = Harness::sqlite().await;
    let permissions = r#"{"*": "rw", "123": "rw"}"#;

    let info = ServiceInfo::new("service0", 0)
        .with_permissions(permissions)
        .with_network(Some(4096), Some(8192));
    assert!(h.install(info).await.is_ok());

    assert_eq!(
        h.registry.service("service0").await.unwrap().permissions,
        permissions
    );
    assert_eq!(h.runtime.permissions("service0").as_deref(), Some(permissions));
}

#[tokio::test]
async fn test_service_address() {
    let mut h = Harness::new().await;
    assert!(h.install(ServiceInfo::new("svc0", 0)).await.is_ok());

    assert_eq!(
        h.launcher.service_address("svc0").await,
        Ok(IpAddr::V4(Ipv4Addr::new(172, 19, 0, 2)))
    );
    assert_eq!(
        h.launcher.service_address("ghost").await,
        Err(LauncherError::NotFound("ghost".into()))
    );
}

#[tokio::test]
async fn test_close_drains_queued_requests() {
    let mut h = Harness::new().await;
    h.provider.set_delay(Duration::from_millis(10));

    for i in 0..4 {
        h.launcher.install(ServiceInfo::new(format!("svc{i}"), 0)).unwrap();
    }
    h.launcher.close().await;

    let mut events = Vec::new();
    while let Some(event) = h.status.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(StatusEvent::is_ok));
    assert_eq!(h.registry.services().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_first_sweep_after_restart_starts_recorded_services() {
    let mut h = Harness::sqlite().await;
    let u1 = UserSet::new(["u1"]);
    let u2 = UserSet::new(["u2"]);

    h.launcher.set_users(u2).await.unwrap();
    assert!(h.install(ServiceInfo::new("other", 0)).await.is_ok());
    h.launcher.set_users(u1.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("svc0", 0)).await.is_ok());
    assert_eq!(h.state("svc0").await, ServiceState::Running);
    assert_eq!(h.state("other").await, ServiceState::Stopped);

    let h = h.restart().await;
    assert!(h.runtime.running().is_empty());

    let report = h.launcher.set_users(u1.clone()).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(report.stopped, 1);
    assert_eq!(h.runtime.running(), vec!["svc0"]);
    assert_eq!(h.state("svc0").await, ServiceState::Running);
    assert_eq!(h.state("other").await, ServiceState::Stopped);

    let report = h.launcher.set_users(u1).await.unwrap();
    assert_eq!(report.kept, 2);
    assert_eq!(h.runtime.count(|c| *c == RuntimeCall::Start("svc0".into())), 1);
    assert_eq!(h.provider.fetches("svc0"), 0);
}

#[tokio::test]
async fn test_remove_all_reports_surviving_records() {
    let mut h = Harness::new().await;
    for id in ["svc0", "svc1"] {
        assert!(h.install(ServiceInfo::new(id, 0)).await.is_ok());
    }
    h.runtime.fail_unregister("svc1");

    let err = h.launcher.remove_all().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsistencyFailure);
    assert!(err.to_string().contains("svc1"));

    assert!(h.registry.find_service("svc0").await.unwrap().is_none());
    let left = h.registry.service("svc1").await.unwrap();
    assert_eq!(left.status, ServiceStatus::Error);
    assert!(!h.registry.users_list().await.unwrap().is_empty());

    h.runtime.clear_failures();
    h.launcher.remove_all().await.unwrap();
    assert!(h.registry.services().await.unwrap().is_empty());
    assert!(h.registry.users_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_stop_is_listed_in_sweep_report() {
    let mut h = Harness::new().await;
    h.launcher.set_users(UserSet::new(["u1"])).await.unwrap();
    assert!(h.install(ServiceInfo::new("svc-a", 0)).await.is_ok());
    assert!(h.install(ServiceInfo::new("svc-b", 0)).await.is_ok());
    h.runtime.fail_stop("svc-a");

    let report = h.launcher.set_users(UserSet::new(["u2"])).await.unwrap();
    assert_eq!(report.failed, vec!["svc-a".to_string()]);
    assert_eq!(report.stopped, 1);

    let record = h.registry.service("svc-a").await.unwrap();
    assert_eq!(record.state, ServiceState::Running);
    assert_eq!(record.status, ServiceStatus::Error);
    assert_eq!(h.runtime.running(), vec!["svc-a"]);
    assert_eq!(h.state("svc-b").await, ServiceState::Stopped);
}

#[tokio::test]
async fn test_expired_service_that_cannot_be_reclaimed_fails_the_sweep() {
    let mut h = Harness::new().await;
    let users = UserSet::new(["u1"]);
    h.launcher.set_users(users.clone()).await.unwrap();
    assert!(h.install(ServiceInfo::new("old", 0)).await.is_ok());

    let past = chrono::Utc::now() - chrono::Duration::days(31);
    h.registry.set_service_start_time("old", past).await.unwrap();
    h.runtime.fail_unregister("old");

    let err = h.launcher.set_users(users).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsistencyFailure);
    assert!(err.to_string().contains("old"));
    assert!(h.registry.find_service("old").await.unwrap().is_some());
}

#[tokio::test]
async fn test_storage_failure_after_start_is_reported_without_rollback() {
    let (mut h, registry) = Harness::mock_registry().await;
    registry.fail_writes("svc0");

    let event = h.install(ServiceInfo::new("svc0", 1)).await;
    assert_eq!(event.action, Action::Install);
    assert_eq!(event.version, 1);
    assert_eq!(event.error.map(|e| e.kind()), Some(ErrorKind::StorageFailure));

    assert!(h.registry.find_service("svc0").await.unwrap().is_none());
    assert!(h.runtime.is_running("svc0"));
    assert!(!h
        .runtime
        .calls()
        .contains(&RuntimeCall::Unregister("svc0".into())));
    assert!(h.config.services_dir().join("svc0_v1").exists());
}
