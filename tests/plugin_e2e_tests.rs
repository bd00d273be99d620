//! End-to-end tests: the supervisor launching the real InfluxDB plugin binary.

mod common;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, MockInflux};
use dbplugin::dbplugin::*;
use dbplugin::middleware::MetricsRegistry;
use dbplugin::plugin::{
    wrapping, InMemoryWrapper, PluginRunner, PluginSupervisor, ResponseWrapper, SupervisorOptions,
};

const PLUGIN_BIN: &str = env!("CARGO_BIN_EXE_influxdb-database-plugin");

fn supervisor(options: SupervisorOptions) -> PluginSupervisor {
    PluginSupervisor::new(
        PluginRunner::new("influxdb", PLUGIN_BIN).with_env("DBPLUGIN_LOG", "debug"),
        options,
    )
}

fn new_user_request() -> NewUserRequest {
    NewUserRequest {
        username_config: UsernameMetadata {
            display_name: "token".to_string(),
            role_name: "reader".to_string(),
        },
        password: "Sup3r-secret".to_string(),
        ..Default::default()
    }
}

async fn initialize(db: &dyn Database, influx: &MockInflux) {
    let resp = db
        .initialize(InitializeRequest {
            config: influx.config(),
            verify_connection: true,
        })
        .await
        .unwrap();
    assert_eq!(
        resp.config["port"],
        ConfigValue::Int(i64::from(influx.addr.port()))
    );
}

// ============================================================================
// Auto-mTLS
// ============================================================================

#[tokio::test]
async fn test_automtls_handles_share_one_process() {
    let influx = MockInflux::start().await;
    let supervisor = supervisor(SupervisorOptions::default());

    let a = supervisor.database("a").await.unwrap();
    let b = supervisor.database("b").await.unwrap();
    assert_eq!(a.protocol_version(), 6);
    assert!(a.is_multiplexed());
    assert_eq!(a.pid(), b.pid());
    assert_ne!(a.multiplex_id(), b.multiplex_id());
    assert_eq!(supervisor.process_count(), 1);
    assert_eq!(supervisor.handle_count(), 2);

    // Same id, same handle.
    let again = supervisor.database("a").await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));

    initialize(a.as_ref(), &influx).await;
    let username = a.new_user(new_user_request()).await.unwrap().username;
    assert!(username.starts_with("v_token_reader_"), "{username}");
    assert_eq!(influx.user_names(), vec![username.clone()]);
    assert_eq!(a.type_name().await.unwrap(), "influxdb");

    // `b` has its own uninitialised instance.
    let err = b.new_user(new_user_request()).await.unwrap_err();
    assert!(err.to_string().contains("has not been initialized"), "{err}");

    a.delete_user(DeleteUserRequest {
        username,
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(influx.user_names().is_empty());

    assert!(supervisor.close("a").await);
    assert_eq!(supervisor.process_count(), 1);
    assert!(supervisor.close("b").await);
    assert!(!supervisor.close("b").await);
    assert!(wait_for(Duration::from_secs(5), || supervisor.process_count() == 0).await);
}

#[tokio::test]
async fn test_handles_are_metered_on_the_host() {
    let influx = MockInflux::start().await;
    let registry = Arc::new(MetricsRegistry::new());
    let supervisor = supervisor(SupervisorOptions::default().with_metrics(Arc::clone(&registry)));

    let db = supervisor.database("metered").await.unwrap();
    let err = db.new_user(new_user_request()).await.unwrap_err();
    assert!(err.to_string().contains("has not been initialized"), "{err}");

    initialize(db.as_ref(), &influx).await;
    db.new_user(new_user_request()).await.unwrap();

    assert_eq!(registry.counter("database.initialize"), 1);
    assert_eq!(registry.counter("database.influxdb.new_user"), 2);
    assert_eq!(registry.counter("database.influxdb.new_user.error"), 1);
    assert_eq!(registry.durations("database.influxdb.new_user").unwrap().count, 2);

    supervisor.shutdown().await;
    assert_eq!(registry.counter("database.influxdb.close"), 1);
}

#[tokio::test]
async fn test_plugin_type_in_metadata_mode() {
    let supervisor = supervisor(SupervisorOptions::default());
    assert_eq!(supervisor.plugin_type().await.unwrap(), "influxdb");
    assert!(wait_for(Duration::from_secs(5), || supervisor.process_count() == 0).await);
}

// ============================================================================
// Wrapped TLS
// ============================================================================

#[tokio::test]
async fn test_wrapped_tls_identity() {
    let influx = MockInflux::start().await;

    let wrapper = Arc::new(InMemoryWrapper::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, wrapping::router(Arc::clone(&wrapper))).into_future());

    let shared: Arc<dyn ResponseWrapper> = Arc::clone(&wrapper) as Arc<dyn ResponseWrapper>;
    let options = SupervisorOptions::default().with_wrapping(shared, format!("http://{host_addr}"));
    let supervisor = supervisor(options);

    let db = supervisor.database("wrapped").await.unwrap();
    // The plugin redeemed its single-use token.
    assert!(wrapper.is_empty());

    initialize(db.as_ref(), &influx).await;
    let username = db.new_user(new_user_request()).await.unwrap().username;
    assert_eq!(influx.user_names(), vec![username]);

    supervisor.shutdown().await;
    assert_eq!(supervisor.handle_count(), 0);
    assert!(wait_for(Duration::from_secs(5), || supervisor.process_count() == 0).await);
}

// ============================================================================
// Process Failure
// ============================================================================

#[tokio::test]
async fn test_killed_plugin_surfaces_shutdown_and_is_replaced() {
    let influx = MockInflux::start().await;
    let supervisor = Arc::new(supervisor(SupervisorOptions::default()));

    let db = supervisor.database("a").await.unwrap();
    initialize(db.as_ref(), &influx).await;
    let pid = db.pid().unwrap();

    influx.delay_create(Duration::from_secs(3));
    let in_flight = {
        let db = Arc::clone(&db);
        tokio::spawn(async move { db.new_user(new_user_request()).await })
    };
    let create_started = || {
        influx
            .calls()
            .iter()
            .any(|call| call == "POST /api/v2/users")
    };
    assert!(wait_for(Duration::from_secs(2), create_started).await);

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let err = tokio::time::timeout(Duration::from_secs(5), in_flight)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_plugin_shutdown(), "{err}");
    assert!(db.is_shut_down());

    let replacement = supervisor.database("a").await.unwrap();
    assert!(!Arc::ptr_eq(&db, &replacement));
    assert_ne!(replacement.pid(), Some(pid));
    assert_eq!(supervisor.handle_count(), 1);

    supervisor.shutdown().await;
    assert!(wait_for(Duration::from_secs(5), || supervisor.process_count() == 0).await);
}

#[tokio::test]
async fn test_shutdown_closes_every_handle() {
    let supervisor = supervisor(SupervisorOptions::default());
    for id in ["a", "b", "c"] {
        supervisor.database(id).await.unwrap();
    }
    assert_eq!(supervisor.handle_count(), 3);
    assert_eq!(supervisor.process_count(), 1);

    supervisor.shutdown().await;
    assert_eq!(supervisor.handle_count(), 0);
    assert!(wait_for(Duration::from_secs(5), || supervisor.process_count() == 0).await);
}
