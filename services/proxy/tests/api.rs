//! Control-plane behaviour end to end: the HTTP surface, the API client,
//! and state persistence.


use std::env::temp_dir;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use harness::{backend_config, refused_addr, roundtrip, service_config, spawn_control_plane, ReplyServer};

use capstan_client::{ApiClient, ClientError, Config};
use capstan_proxy::{Registry, StateFiles};

fn scratch(name: &str) -> PathBuf {
    temp_dir().join(format!("capstan-api-{}-{}.json", name, std::process::id()))
}

async fn spawn_daemon(state_path: Option<PathBuf>) -> (Arc<Registry>, ApiClient) {
    let registry = Arc::new(Registry::new());
    let files = Arc::new(StateFiles::new(None, state_path));
    let addr = spawn_control_plane(Arc::clone(&registry), files)
        .await
        .expect("control plane");
    (registry, ApiClient::new(&addr.to_string()))
}

#[tokio::test]
async fn create_service_and_proxy_traffic() {
    let b1 = ReplyServer::spawn().await.unwrap();
    let listen_addr = refused_addr().await;

    let (registry, client) = spawn_daemon(None).await;

    let mut cfg = service_config("s1", vec![backend_config("b1", b1.addr)]);
    cfg.address = listen_addr.to_string();
    let stat = client.update_service("s1", &cfg, false).await.unwrap();
    assert_eq!(stat.name, "s1");
    assert_eq!(stat.backends.len(), 1);
    assert!(stat.backends[0].up);

    let reply = roundtrip(listen_addr, b"x").await.unwrap();
    assert_eq!(reply, b1.addr.to_string().as_bytes());

    let stat = client.service_stats("s1").await.unwrap();
    assert_eq!(stat.backends[0].conns, 1);

    let backend = client.backend_stats("s1", "b1").await.unwrap();
    assert_eq!(backend.conns, 1);

    registry.stop_all().await;
}

#[tokio::test]
async fn config_readback_is_safe_to_re_post() {
    let b1 = ReplyServer::spawn().await.unwrap();

    let (registry, client) = spawn_daemon(None).await;

    let mut cfg = service_config("s1", vec![backend_config("b1", b1.addr)]);
    cfg.check_interval = 5000;
    client.update_service("s1", &cfg, false).await.unwrap();

    let snapshot = client.get_config().await.unwrap();
    assert_eq!(snapshot.services.len(), 1);
    let svc = &snapshot.services[0];
    assert_eq!(svc.check_interval, 5000);
    assert_eq!(svc.balance, "RR", "snapshot carries normalised defaults");

    let service_before = registry.get_service("s1").await.unwrap();
    client.update_service("s1", svc, false).await.unwrap();
    let service_after = registry.get_service("s1").await.unwrap();
    assert!(
        Arc::ptr_eq(&service_before, &service_after),
        "re-posting the readback must not bounce the listener"
    );

    registry.stop_all().await;
}

#[tokio::test]
async fn stats_listing_and_missing_entities() {
    let b1 = ReplyServer::spawn().await.unwrap();
    let (registry, client) = spawn_daemon(None).await;

    client
        .update_service(
            "s1",
            &service_config("s1", vec![backend_config("b1", b1.addr)]),
            false,
        )
        .await
        .unwrap();

    let stats = client.get_stats().await.unwrap();
    assert_eq!(stats.services.len(), 1);
    assert_eq!(stats.services[0].backends[0].name, "b1");

    match client.service_stats("missing").await {
        Err(ClientError::Api { status: 404, .. }) => {}
        other => panic!("expected 404, got {other:?}"),
    }
    match client.backend_stats("s1", "missing").await {
        Err(ClientError::Api { status: 404, .. }) => {}
        other => panic!("expected 404, got {other:?}"),
    }

    registry.stop_all().await;
}

#[tokio::test]
async fn validation_errors_are_bad_requests() {
    let (registry, client) = spawn_daemon(None).await;

    let mut cfg = service_config("s1", Vec::new());
    cfg.network = "unix".to_string();
    match client.update_service("s1", &cfg, false).await {
        Err(ClientError::Api { status: 400, message }) => {
            assert!(message.contains("unknown network"), "got: {message}");
        }
        other => panic!("expected 400, got {other:?}"),
    }

    // A backend family clash is rejected before anything mutates.
    let mut cfg = service_config("s1", vec![backend_config("b1", refused_addr().await)]);
    cfg.backends[0].network = "udp".to_string();
    match client.update_service("s1", &cfg, false).await {
        Err(ClientError::Api { status: 400, .. }) => {}
        other => panic!("expected 400, got {other:?}"),
    }
    assert!(registry.get_service("s1").await.is_none());

    registry.stop_all().await;
}

#[tokio::test]
async fn duplicate_address_is_rejected_over_the_api() {
    let (registry, client) = spawn_daemon(None).await;

    let cfg = service_config("s1", Vec::new());
    client.update_service("s1", &cfg, false).await.unwrap();

    let mut clash = service_config("s2", Vec::new());
    clash.address = cfg.address.clone();
    match client.update_service("s2", &clash, false).await {
        Err(ClientError::Api { status: 400, message }) => {
            assert!(message.contains("already bound"), "got: {message}");
        }
        other => panic!("expected 400, got {other:?}"),
    }

    registry.stop_all().await;
}

#[tokio::test]
async fn backend_lifecycle_over_the_api() {
    let b1 = ReplyServer::spawn().await.unwrap();
    let b2 = ReplyServer::spawn().await.unwrap();

    let (registry, client) = spawn_daemon(None).await;
    client
        .update_service(
            "s1",
            &service_config("s1", vec![backend_config("b1", b1.addr)]),
            false,
        )
        .await
        .unwrap();
    let service = registry.get_service("s1").await.unwrap();

    let stat = client
        .update_backend("s1", "b2", &backend_config("b2", b2.addr))
        .await
        .unwrap();
    assert_eq!(stat.name, "b2");
    assert!(
        Arc::ptr_eq(&service, &registry.get_service("s1").await.unwrap()),
        "backend update must not bounce the listener"
    );

    let stat = client.remove_backend("s1", "b1").await.unwrap();
    assert_eq!(stat.backends.len(), 1);
    assert_eq!(stat.backends[0].name, "b2");

    match client.remove_backend("s1", "b1").await {
        Err(ClientError::Api { status: 404, .. }) => {}
        other => panic!("expected 404, got {other:?}"),
    }

    registry.stop_all().await;
}

#[tokio::test]
async fn delete_service_removes_it() {
    let (registry, client) = spawn_daemon(None).await;
    client
        .update_service("s1", &service_config("s1", Vec::new()), false)
        .await
        .unwrap();

    let stats = client.remove_service("s1").await.unwrap();
    assert!(stats.services.is_empty());
    assert!(registry.get_service("s1").await.is_none());

    match client.remove_service("s1").await {
        Err(ClientError::Api { status: 404, .. }) => {}
        other => panic!("expected 404, got {other:?}"),
    }

    registry.stop_all().await;
}

#[tokio::test]
async fn mutations_rewrite_the_state_file() {
    let b1 = ReplyServer::spawn().await.unwrap();
    let state_path = scratch("state");
    let _ = fs::remove_file(&state_path);

    let (registry, client) = spawn_daemon(Some(state_path.clone())).await;

    client
        .update_service(
            "s1",
            &service_config("s1", vec![backend_config("b1", b1.addr)]),
            false,
        )
        .await
        .unwrap();

    let mut persisted = None;
    for _ in 0..100 {
        if let Ok(raw) = fs::read_to_string(&state_path) {
            persisted = serde_json::from_str::<Config>(&raw).ok();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let persisted = persisted.expect("state file written after mutation");
    assert_eq!(persisted.services.len(), 1);
    assert_eq!(persisted.services[0].name, "s1");
    assert_eq!(persisted.services[0].backends.len(), 1);

    let _ = fs::remove_file(&state_path);
    registry.stop_all().await;
}
