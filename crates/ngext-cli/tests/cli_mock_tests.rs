//! Mock-based command tests.
//!
//! These tests call command functions directly with a `CommandContext`
//! backed by `MockHost` and `MockTunnelService`, with the endpoint store and
//! status snapshot in a temp directory.

use ngext_cli::commands::{self, CommandContext, OptionEdits};
use ngext_config::GlobalConfig;
use ngext_core::test_support::{mock_container, MockCall, MockHost, MockTunnelService};
use ngext_core::{
    AuthStatus, CoreError, EndpointStatus, EndpointStore, ShellPaths, StatusSnapshot,
    MAX_METADATA_CHARS,
};
use ngext_provider::{AuthError, EndpointKey};
use std::sync::Arc;
use std::time::Duration;

const NGINX_ID: &str = "9a8b7c6d5e4f3a2b1c0d";

struct Fixture {
    ctx: CommandContext,
    host: Arc<MockHost>,
    service: Arc<MockTunnelService>,
    _tmp: tempfile::TempDir,
}

fn fixture(host: MockHost) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let host = Arc::new(host);
    let service = Arc::new(MockTunnelService::new());
    let paths = ShellPaths {
        store: tmp.path().join("endpoints.json"),
        status: tmp.path().join("status.json"),
    };
    Fixture {
        ctx: CommandContext::new(GlobalConfig::default(), host.clone(), service.clone(), paths),
        host,
        service,
        _tmp: tmp,
    }
}

fn nginx_host() -> MockHost {
    MockHost::new()
        .with_token("tok")
        .with_containers(vec![mock_container(NGINX_ID, "nginx", &[80, 8080])])
}

fn nginx_key() -> EndpointKey {
    EndpointKey::new(NGINX_ID, 8080)
}

fn stored(f: &Fixture) -> EndpointStore {
    EndpointStore::load_from(&f.ctx.paths.store).unwrap()
}

fn describe(text: &str) -> OptionEdits {
    OptionEdits {
        description: Some(text.to_string()),
        ..Default::default()
    }
}

// ---- setup ----

#[tokio::test]
async fn test_setup_stores_validated_token() {
    let f = fixture(MockHost::new());
    commands::setup(&f.ctx, Some(" tok_123 ".to_string()))
        .await
        .unwrap();

    assert_eq!(f.host.stored_token().as_deref(), Some("tok_123"));
    assert!(f.service.was_called(&MockCall::ValidateToken {
        token: "tok_123".to_string()
    }));
}

#[tokio::test]
async fn test_setup_rejected_token_not_stored() {
    let f = fixture(MockHost::new());
    f.service
        .set_validate_result(Err(AuthError::Invalid("bad token".to_string())));

    let err = commands::setup(&f.ctx, Some("nope".to_string()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad token"));
    assert_eq!(f.host.stored_token(), None);
}

#[tokio::test]
async fn test_setup_reset_removes_token() {
    let f = fixture(MockHost::new().with_token("tok"));
    commands::reset(&f.ctx, true).await.unwrap();
    assert_eq!(f.host.stored_token(), None);
}

// ---- target resolution ----

#[tokio::test]
async fn test_resolve_by_name_and_id_prefix() {
    let f = fixture(nginx_host());
    let by_name = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    let by_prefix = commands::resolve_target(&f.ctx, "9a8b", 8080, false)
        .await
        .unwrap();

    assert_eq!(by_name.key, nginx_key());
    assert_eq!(by_prefix, by_name);
    assert_eq!(by_name.container_name, "nginx");
}

#[tokio::test]
async fn test_resolve_unknown_port_fails() {
    let f = fixture(nginx_host());
    let err = commands::resolve_target(&f.ctx, "nginx", 9999, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::PortNotFound { port: 9999, .. })
    ));
}

// ---- enable / set / disable ----

#[tokio::test]
async fn test_enable_writes_store() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    commands::enable(&f.ctx, &target, &describe("nginx docker desktop endpoint"))
        .await
        .unwrap();

    let store = stored(&f);
    let config = store.get(&nginx_key()).unwrap();
    assert!(config.enabled);
    assert_eq!(config.container_name, "nginx");
    assert_eq!(config.options.description, "nginx docker desktop endpoint");
    assert!(!config.options.pooling_enabled);
    // The daemon does the tunneling
    assert!(f.service.tunnel_calls().is_empty());
}

#[tokio::test]
async fn test_enable_requires_setup() {
    let f = fixture(MockHost::new().with_containers(vec![mock_container(NGINX_ID, "nginx", &[8080])]));
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();

    let err = commands::enable(&f.ctx, &target, &OptionEdits::default())
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::NotSetup)));
    assert!(stored(&f).get(&nginx_key()).is_none());
}

#[tokio::test]
async fn test_enable_rejects_oversized_metadata() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    let edits = OptionEdits {
        metadata: Some("m".repeat(MAX_METADATA_CHARS + 1)),
        ..Default::default()
    };

    let err = commands::enable(&f.ctx, &target, &edits).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::Validation(_))
    ));
    assert!(stored(&f).get(&nginx_key()).is_none());
}

#[tokio::test]
async fn test_set_merges_options_and_keeps_enabled() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    commands::enable(&f.ctx, &target, &describe("web"))
        .await
        .unwrap();

    let edits = OptionEdits {
        pooling: Some(true),
        ..Default::default()
    };
    commands::set(&f.ctx, &target, &edits).await.unwrap();

    let store = stored(&f);
    let config = store.get(&nginx_key()).unwrap();
    assert!(config.enabled);
    assert!(config.options.pooling_enabled);
    assert_eq!(config.options.description, "web");
}

#[tokio::test]
async fn test_set_on_new_port_stays_disabled() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 80, false)
        .await
        .unwrap();
    commands::set(&f.ctx, &target, &describe("later"))
        .await
        .unwrap();

    let store = stored(&f);
    let config = store.get(&EndpointKey::new(NGINX_ID, 80)).unwrap();
    assert!(!config.enabled);
    assert_eq!(config.options.description, "later");
}

#[tokio::test]
async fn test_disable_after_container_is_gone() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    commands::enable(&f.ctx, &target, &describe("web"))
        .await
        .unwrap();

    f.host.set_containers(vec![]);
    assert!(commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .is_err());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, true)
        .await
        .unwrap();
    commands::disable(&f.ctx, &target).await.unwrap();

    let store = stored(&f);
    let config = store.get(&nginx_key()).unwrap();
    assert!(!config.enabled);
    assert_eq!(config.options.description, "web");
}

// ---- ls / open ----

#[tokio::test]
async fn test_rows_without_daemon_come_from_listing() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    commands::enable(&f.ctx, &target, &OptionEdits::default())
        .await
        .unwrap();

    let rows = commands::port_rows(&f.ctx).await.unwrap();
    assert_eq!(rows.len(), 2);
    let row = rows.iter().find(|r| r.port == 8080).unwrap();
    assert!(row.enabled);
    assert_eq!(row.status, EndpointStatus::Disabled);
    assert!(row.url.is_none());
}

#[tokio::test]
async fn test_open_requires_running_daemon() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    let err = commands::open(&f.ctx, &target).await.unwrap_err();
    assert!(err.to_string().contains("not running"));
}

#[tokio::test]
async fn test_open_uses_daemon_snapshot() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();

    let mut rows = commands::port_rows(&f.ctx).await.unwrap();
    for row in rows.iter_mut().filter(|r| r.port == 8080) {
        row.enabled = true;
        row.status = EndpointStatus::Active;
        row.url = Some("https://abc123.ngrok.app".to_string());
    }
    StatusSnapshot {
        pid: 4242,
        updated_at: chrono::Utc::now(),
        auth: AuthStatus {
            is_setup: true,
            has_token: true,
        },
        rows,
        banner: vec![],
    }
    .save_to(&f.ctx.paths.status)
    .unwrap();

    let url = commands::open(&f.ctx, &target).await.unwrap();
    assert_eq!(url, "https://abc123.ngrok.app");
    assert!(f.host.get_calls().contains(&MockCall::OpenExternal { url }));
}

#[tokio::test]
async fn test_stale_snapshot_is_ignored() {
    let f = fixture(nginx_host());
    let mut rows = commands::port_rows(&f.ctx).await.unwrap();
    rows[0].url = Some("https://old.ngrok.app".to_string());
    StatusSnapshot {
        pid: 1,
        updated_at: chrono::Utc::now() - chrono::Duration::hours(1),
        auth: AuthStatus {
            is_setup: true,
            has_token: true,
        },
        rows,
        banner: vec![],
    }
    .save_to(&f.ctx.paths.status)
    .unwrap();

    let rows = commands::port_rows(&f.ctx).await.unwrap();
    assert!(rows.iter().all(|r| r.url.is_none()));
}

// ---- run ----

#[tokio::test(start_paused = true)]
async fn test_run_tunnels_enabled_ports_until_shutdown() {
    let f = fixture(nginx_host());
    let target = commands::resolve_target(&f.ctx, "nginx", 8080, false)
        .await
        .unwrap();
    commands::enable(&f.ctx, &target, &describe("web"))
        .await
        .unwrap();

    let Fixture {
        ctx,
        service,
        _tmp,
        ..
    } = f;
    let status_path = ctx.paths.status.clone();
    commands::run_until(ctx, tokio::time::sleep(Duration::from_secs(3)))
        .await
        .unwrap();

    let calls = service.tunnel_calls();
    assert!(matches!(&calls[0], MockCall::Create { description, .. } if description == "web"));
    assert!(calls.iter().any(|c| matches!(c, MockCall::Delete { .. })));
    assert_eq!(service.live_count(), 0);
    assert!(!status_path.exists(), "status file removed on shutdown");
}
