//! AppShell scenarios: auth gating, option edits, container churn and the
//! daemon loop, all against the mock host and tunnel service.

use ngext_config::GlobalConfig;
use ngext_core::test_support::{mock_container, MockCall, MockHost, MockTunnelService};
use ngext_core::{
    AppShell, BannerKey, CoreError, EndpointConfig, EndpointOptions, EndpointStatus,
    EndpointStore, ShellPaths, ShellView, MAX_METADATA_CHARS,
};
use ngext_provider::{AuthError, EndpointKey, TunnelError, TunnelErrorKind};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    shell: AppShell,
    host: Arc<MockHost>,
    service: Arc<MockTunnelService>,
}

const NGINX_ID: &str = "4f3c2b1a0e9d8c7b6a5f";

fn nginx_key() -> EndpointKey {
    EndpointKey::new(NGINX_ID, 8080)
}

fn harness(host: MockHost, store: EndpointStore) -> Harness {
    let host = Arc::new(host);
    let service = Arc::new(MockTunnelService::new());
    let shell = AppShell::new(GlobalConfig::default(), host.clone(), service.clone(), store);
    Harness {
        shell,
        host,
        service,
    }
}

async fn ready() -> Harness {
    let host = MockHost::new()
        .with_token("tok")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[80, 8080])]);
    let mut h = harness(host, EndpointStore::new());
    h.shell.start().await;
    h
}

fn row_status(shell: &AppShell, key: &EndpointKey) -> Option<EndpointStatus> {
    shell
        .rows()
        .into_iter()
        .find(|r| &r.key == key && r.tunnelable)
        .map(|r| r.status)
}

#[tokio::test(start_paused = true)]
async fn test_setup_view_until_token_configured() {
    let host = MockHost::new().with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]);
    let mut h = harness(host, EndpointStore::new());
    h.shell.start().await;

    assert!(matches!(h.shell.view(), ShellView::Setup { .. }));
    assert!(!h.host.get_calls().contains(&MockCall::ListContainers));
    assert!(matches!(
        h.shell.enable(&nginx_key(), EndpointOptions::default()),
        Err(CoreError::NotSetup)
    ));
    assert!(h.service.tunnel_calls().is_empty());

    h.shell.complete_setup("tok").await.unwrap();
    match h.shell.view() {
        ShellView::Dashboard { rows, banner } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, EndpointStatus::Disabled);
            assert!(banner.is_empty());
        }
        other => panic!("expected dashboard, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_token_stays_in_setup() {
    let mut h = harness(MockHost::new(), EndpointStore::new());
    h.service
        .set_validate_result(Err(AuthError::Invalid("unknown token".to_string())));
    h.shell.start().await;

    assert!(h.shell.complete_setup("bogus").await.is_err());
    match h.shell.view() {
        ShellView::Setup { last_error } => assert_eq!(last_error.as_deref(), Some("unknown token")),
        other => panic!("expected setup, got {:?}", other),
    }
    assert_eq!(h.host.stored_token(), None);
}

#[tokio::test(start_paused = true)]
async fn test_complete_setup_with_current_token_is_noop() {
    let mut h = ready().await;
    let validations = h.service.get_calls().len();

    h.shell.complete_setup("tok").await.unwrap();
    assert_eq!(h.host.token_writes(), 0);
    assert_eq!(h.service.get_calls().len(), validations);
}

#[tokio::test(start_paused = true)]
async fn test_enable_nginx_endpoint() {
    let mut h = ready().await;
    let key = nginx_key();

    h.shell
        .enable(
            &key,
            EndpointOptions::new(false, "nginx docker desktop endpoint", ""),
        )
        .unwrap();
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Pending));
    h.shell.settle().await;

    assert!(h.service.was_called(&MockCall::Create {
        key: key.clone(),
        pooling: false,
        description: "nginx docker desktop endpoint".to_string(),
        metadata: String::new(),
    }));
    let row = h
        .shell
        .rows()
        .into_iter()
        .find(|r| r.key == key)
        .unwrap();
    assert_eq!(row.status, EndpointStatus::Active);
    assert!(row.enabled);
    assert!(row.url.is_some());

    let url = h.shell.open_url(&key).await.unwrap();
    assert!(h.host.get_calls().contains(&MockCall::OpenExternal { url }));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_commit_once() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;

    for text in ["n", "ng", "ngi", "ngin", "nginx"] {
        h.shell
            .edit_options(&key, EndpointOptions::new(false, text, ""))
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        h.shell.on_timer(tokio::time::Instant::now());
    }
    assert_eq!(h.service.tunnel_calls().len(), 1, "nothing sent mid-burst");

    h.shell.settle().await;
    let calls = h.service.tunnel_calls();
    assert_eq!(calls.len(), 2, "{:?}", calls);
    assert!(matches!(&calls[1], MockCall::Update { description, .. } if description == "nginx"));
    assert_eq!(h.service.live_for(&key)[0].description, "nginx");
    assert_eq!(
        h.shell.intents().get(&key).unwrap().options.description,
        "nginx"
    );
}

#[tokio::test(start_paused = true)]
async fn test_apply_now_skips_debounce() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;

    h.shell
        .edit_options(&key, EndpointOptions::new(false, "now", ""))
        .unwrap();
    assert!(h.shell.pending_options(&key).is_some());
    assert!(h.shell.apply_now(&key).unwrap());
    assert!(h.shell.pending_options(&key).is_none());
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Pending));
    assert!(!h.shell.apply_now(&key).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_metadata_never_reaches_service() {
    let mut h = ready().await;
    let key = nginx_key();
    let too_long = "x".repeat(MAX_METADATA_CHARS + 1);

    let err = h
        .shell
        .enable(&key, EndpointOptions::new(false, "", too_long.clone()))
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;
    assert!(matches!(
        h.shell
            .edit_options(&key, EndpointOptions::new(false, "", too_long)),
        Err(CoreError::Validation(_))
    ));
    h.shell.settle().await;

    assert_eq!(h.service.tunnel_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pooling_toggle_through_shell() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Active));

    h.shell
        .edit_options(&key, EndpointOptions::new(true, "", ""))
        .unwrap();
    h.shell.apply_now(&key).unwrap();
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Pending));
    h.shell.settle().await;

    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Active));
    assert_eq!(h.service.max_live_per_key(), 1);
    assert!(h.service.live_for(&key)[0].pooling_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_or_udp_port_rejected() {
    let mut h = ready().await;
    assert!(matches!(
        h.shell
            .enable(&EndpointKey::new(NGINX_ID, 9999), EndpointOptions::default()),
        Err(CoreError::PortNotFound { .. })
    ));
    assert!(matches!(
        h.shell
            .enable(&EndpointKey::new("missing", 80), EndpointOptions::default()),
        Err(CoreError::ContainerNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_container_removed_deletes_tunnel_and_row() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;

    h.host.set_containers(vec![]);
    let diff = h.shell.refresh_containers().await.unwrap();
    assert_eq!(diff.removed.len(), 1);

    let rows = h.shell.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].orphan);
    assert_eq!(rows[0].status, EndpointStatus::Stopped);

    h.shell.settle().await;
    assert!(h.shell.rows().is_empty());
    assert_eq!(h.service.live_count(), 0);
    assert!(!h.shell.intents().get(&key).unwrap().enabled);
}

#[tokio::test(start_paused = true)]
async fn test_returning_container_starts_disabled() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell
        .enable(&key, EndpointOptions::new(true, "kept", ""))
        .unwrap();
    h.shell.settle().await;

    h.host.set_containers(vec![]);
    h.shell.refresh_containers().await;
    h.shell.settle().await;

    h.host
        .set_containers(vec![mock_container(NGINX_ID, "nginx", &[80, 8080])]);
    let diff = h.shell.refresh_containers().await.unwrap();
    assert_eq!(diff.added.len(), 1);
    h.shell.settle().await;

    let row = h.shell.rows().into_iter().find(|r| r.key == key).unwrap();
    assert_eq!(row.status, EndpointStatus::Disabled);
    assert!(!row.enabled);
    assert_eq!(row.options.description, "kept");
    assert_eq!(h.service.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_intents_disabled_on_first_listing() {
    let mut store = EndpointStore::new();
    store.upsert(EndpointConfig::new(
        &EndpointKey::new("gone", 3000),
        "old-app",
        true,
        EndpointOptions::default(),
    ));
    let host = MockHost::new()
        .with_token("tok")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]);
    let mut h = harness(host, store);
    h.shell.start().await;
    h.shell.settle().await;

    let config = h
        .shell
        .intents()
        .get(&EndpointKey::new("gone", 3000))
        .unwrap();
    assert!(!config.enabled);
    assert!(h.service.tunnel_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stored_intents_resume_on_start() {
    let mut store = EndpointStore::new();
    store.upsert(EndpointConfig::new(
        &nginx_key(),
        "nginx",
        true,
        EndpointOptions::new(false, "from disk", ""),
    ));
    let host = MockHost::new()
        .with_token("tok")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]);
    let mut h = harness(host, store);
    h.shell.start().await;
    h.shell.settle().await;

    assert_eq!(row_status(&h.shell, &nginx_key()), Some(EndpointStatus::Active));
    assert_eq!(h.service.live_for(&nginx_key())[0].description, "from disk");
}

#[tokio::test(start_paused = true)]
async fn test_host_failure_shows_banner_until_recovery() {
    let mut h = ready().await;
    h.host.set_list_error(Some("docker daemon not running".to_string()));
    assert!(h.shell.refresh_containers().await.is_none());

    match h.shell.view() {
        ShellView::Dashboard { rows, banner } => {
            assert_eq!(rows.len(), 2, "previous list is kept");
            assert_eq!(banner.len(), 1);
            assert_eq!(banner[0].key, BannerKey::Host);
        }
        other => panic!("expected dashboard, got {:?}", other),
    }

    h.host.set_list_error(None);
    h.shell.refresh_containers().await;
    assert!(h.shell.banner().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tunnel_errors_in_banner_and_manual_retry() {
    let mut h = ready().await;
    let key = nginx_key();
    h.service
        .fail_next(TunnelError::new(TunnelErrorKind::QuotaExceeded, "endpoint limit"));
    h.shell.enable(&key, EndpointOptions::default()).unwrap();
    h.shell.settle().await;

    let banner = h.shell.banner().entries();
    assert_eq!(banner.len(), 1);
    assert_eq!(banner[0].key, BannerKey::Endpoint(key.clone()));
    assert!(banner[0].message.contains("endpoint limit"));

    assert!(h.shell.retry(&key));
    h.shell.settle().await;
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Active));
    assert!(h.shell.banner().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_expired_returns_to_setup() {
    let mut h = ready().await;
    h.service
        .fail_next(TunnelError::new(TunnelErrorKind::AuthExpired, "ERR_NGROK_4018"));
    h.service
        .set_validate_result(Err(AuthError::Invalid("revoked".to_string())));

    h.shell
        .enable(&nginx_key(), EndpointOptions::default())
        .unwrap();
    h.shell.settle().await;

    assert!(matches!(h.shell.view(), ShellView::Setup { .. }));
    assert!(!h.shell.reconciler().is_gate_open());
}

#[tokio::test(start_paused = true)]
async fn test_disable_keeps_options() {
    let mut h = ready().await;
    let key = nginx_key();
    h.shell
        .enable(&key, EndpointOptions::new(false, "web", r#"{"team":"a"}"#))
        .unwrap();
    h.shell.settle().await;

    h.shell.disable(&key).unwrap();
    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Stopped));
    h.shell.settle().await;

    assert_eq!(row_status(&h.shell, &key), Some(EndpointStatus::Disabled));
    let config = h.shell.intents().get(&key).unwrap();
    assert!(!config.enabled);
    assert_eq!(config.options.metadata, r#"{"team":"a"}"#);
}

#[tokio::test(start_paused = true)]
async fn test_reload_picks_up_external_edits() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ShellPaths {
        store: tmp.path().join("endpoints.json"),
        status: tmp.path().join("status.json"),
    };
    let host = Arc::new(
        MockHost::new()
            .with_token("tok")
            .with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]),
    );
    let service = Arc::new(MockTunnelService::new());
    let mut shell = AppShell::open(
        GlobalConfig::default(),
        host.clone(),
        service.clone(),
        paths.clone(),
    )
    .unwrap();
    shell.start().await;
    assert!(!shell.reload_store().unwrap());

    // What `ngext enable` does from another process
    EndpointStore::update_at(&paths.store, |s| {
        s.upsert(EndpointConfig::new(
            &nginx_key(),
            "nginx",
            true,
            EndpointOptions::new(false, "cli", ""),
        ))
    })
    .unwrap();
    assert!(shell.reload_store().unwrap());
    shell.settle().await;
    assert_eq!(row_status(&shell, &nginx_key()), Some(EndpointStatus::Active));

    // What `ngext set` does: options only, debounced
    EndpointStore::update_at(&paths.store, |s| {
        if let Some(c) = s.get_mut(&nginx_key()) {
            c.options.description = "cli v2".to_string();
        }
    })
    .unwrap();
    assert!(!shell.reload_store().unwrap());
    assert!(shell.pending_options(&nginx_key()).is_some());
    shell.settle().await;
    assert_eq!(service.live_for(&nginx_key())[0].description, "cli v2");

    shell.write_snapshot();
    assert!(paths.status.exists());
}

#[tokio::test(start_paused = true)]
async fn test_run_until_tears_down_on_shutdown() {
    let mut store = EndpointStore::new();
    store.upsert(EndpointConfig::new(
        &nginx_key(),
        "nginx",
        true,
        EndpointOptions::default(),
    ));
    let host = MockHost::new()
        .with_token("tok")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]);
    let mut h = harness(host, store);
    h.shell.start().await;

    h.shell
        .run_until(tokio::time::sleep(Duration::from_secs(12)))
        .await;

    assert!(h
        .service
        .get_calls()
        .iter()
        .any(|c| matches!(c, MockCall::Create { .. })));
    assert!(h
        .service
        .get_calls()
        .iter()
        .any(|c| matches!(c, MockCall::Delete { .. })));
    assert_eq!(h.service.live_count(), 0);
    // Container polling kept running
    let listings = h
        .host
        .get_calls()
        .iter()
        .filter(|c| matches!(c, MockCall::ListContainers))
        .count();
    assert!(listings >= 3, "listed {} times", listings);
}

#[tokio::test(start_paused = true)]
async fn test_removed_token_closes_gate_on_next_poll() {
    let mut h = ready().await;
    h.shell
        .enable(&nginx_key(), EndpointOptions::default())
        .unwrap();
    h.shell.settle().await;
    let calls = h.service.tunnel_calls().len();

    h.host.remove_token();
    h.shell.poll().await;

    assert!(!h.shell.is_setup());
    assert!(matches!(h.shell.view(), ShellView::Setup { .. }));
    let port80 = EndpointKey::new(NGINX_ID, 80);
    assert!(matches!(
        h.shell.enable(&port80, EndpointOptions::default()),
        Err(CoreError::NotSetup)
    ));
    h.shell.settle().await;
    assert_eq!(h.service.tunnel_calls().len(), calls);

    // Teardown still reaches the service with the gate closed
    assert!(h.shell.shutdown().await.is_empty());
    assert_eq!(h.service.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_daemon_revalidates_token_periodically() {
    let mut h = ready().await;
    let validations = |service: &MockTunnelService| {
        service
            .get_calls()
            .iter()
            .filter(|c| matches!(c, MockCall::ValidateToken { .. }))
            .count()
    };
    assert_eq!(validations(&h.service), 1);

    h.service
        .set_validate_result(Err(AuthError::Invalid("token revoked".to_string())));
    h.shell
        .run_until(tokio::time::sleep(Duration::from_secs(30)))
        .await;
    // Polls only re-read the stored token
    assert!(h.shell.is_setup());
    assert_eq!(validations(&h.service), 1);

    h.shell
        .run_until(tokio::time::sleep(Duration::from_secs(301)))
        .await;
    assert!(!h.shell.is_setup());
    assert!(validations(&h.service) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_options_save_keeps_banner_and_old_options() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ShellPaths {
        store: tmp.path().join("endpoints.json"),
        status: tmp.path().join("status.json"),
    };
    let host = Arc::new(
        MockHost::new()
            .with_token("tok")
            .with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]),
    );
    let service = Arc::new(MockTunnelService::new());
    let mut shell = AppShell::open(
        GlobalConfig::default(),
        host.clone(),
        service.clone(),
        paths.clone(),
    )
    .unwrap();
    shell.start().await;
    let key = nginx_key();
    shell
        .enable(&key, EndpointOptions::new(false, "v1", ""))
        .unwrap();
    shell.settle().await;

    // A directory where the store file should be makes every save fail
    std::fs::remove_file(&paths.store).unwrap();
    std::fs::create_dir(&paths.store).unwrap();

    shell
        .edit_options(&key, EndpointOptions::new(false, "v2", ""))
        .unwrap();
    shell.settle().await;

    let save_key = BannerKey::Save(key.clone());
    assert!(shell.banner().entries().iter().any(|e| e.key == save_key));
    assert_eq!(shell.intents().get(&key).unwrap().options.description, "v1");
    assert_eq!(service.live_for(&key)[0].description, "v1");
    assert!(!service
        .get_calls()
        .iter()
        .any(|c| matches!(c, MockCall::Update { .. })));

    // Reconciling other endpoints does not wipe the entry
    shell.flush_due(tokio::time::Instant::now());
    shell.settle().await;
    assert!(shell.banner().entries().iter().any(|e| e.key == save_key));

    std::fs::remove_dir(&paths.store).unwrap();
    shell
        .edit_options(&key, EndpointOptions::new(false, "v2", ""))
        .unwrap();
    shell.settle().await;
    assert!(!shell.banner().entries().iter().any(|e| e.key == save_key));
    assert_eq!(service.live_for(&key)[0].description, "v2");
    let saved = EndpointStore::load_from(&paths.store).unwrap();
    assert_eq!(saved.get(&key).unwrap().options.description, "v2");
}

#[tokio::test(start_paused = true)]
async fn test_detected_scheme_used_for_tunnel() {
    let host = MockHost::new()
        .with_token("tok")
        .with_scheme(5432, "tcp")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[80, 5432])]);
    let mut h = harness(host, EndpointStore::new());
    h.shell.start().await;

    let db = EndpointKey::new(NGINX_ID, 5432);
    let web = EndpointKey::new(NGINX_ID, 80);
    h.shell.enable(&db, EndpointOptions::default()).unwrap();
    h.shell.enable(&web, EndpointOptions::default()).unwrap();
    h.shell.settle().await;

    assert_eq!(h.service.live_for(&db)[0].scheme, "tcp");
    assert_eq!(h.service.live_for(&web)[0].scheme, "http");
}
