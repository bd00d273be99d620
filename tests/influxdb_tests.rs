//! InfluxDB adapter against a mock v2 API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockInflux, MOCK_ORG_ID, MOCK_TOKEN};
use dbplugin::dbplugin::{
    ChangeExpiration, ChangePassword, ChangePublicKey, ConfigMap, ConfigValue, CredentialType, Database,
    DeleteUserRequest, InitializeRequest, NewUserRequest, UpdateUserRequest, UsernameMetadata,
};
use dbplugin::influxdb::{self, InfluxDb};
use dbplugin::protocol::{DatabaseClient, DatabaseServer, LoopbackTransport, ShutdownSignal};
use regex::Regex;

// ============================================================================
// Test Helpers
// ============================================================================

async fn initialized(mock: &MockInflux) -> Arc<dyn Database> {
    let db = influxdb::new().unwrap();
    db.initialize(InitializeRequest {
        config: mock.config(),
        verify_connection: true,
    })
    .await
    .unwrap();
    db
}

fn new_user_request(display: &str, role: &str) -> NewUserRequest {
    NewUserRequest {
        username_config: UsernameMetadata {
            display_name: display.to_string(),
            role_name: role.to_string(),
        },
        credential_type: CredentialType::Password,
        password: "s3cr3t-Passw0rd".to_string(),
        ..Default::default()
    }
}

// ============================================================================
// Initialize
// ============================================================================

#[tokio::test]
async fn test_port_string_canonicalised_to_integer() {
    let db = InfluxDb::new();
    let mut config = ConfigMap::new();
    config.insert("host".to_string(), "h".into());
    config.insert("port".to_string(), "8086".into());
    config.insert("token".to_string(), "t".into());
    config.insert("organization".to_string(), "v".into());

    let first = db
        .initialize(InitializeRequest {
            config: config.clone(),
            verify_connection: false,
        })
        .await
        .unwrap();
    assert_eq!(first.config["port"], ConfigValue::Int(8086));

    config.insert("port".to_string(), ConfigValue::Int(8086));
    let second = db
        .initialize(InitializeRequest {
            config,
            verify_connection: false,
        })
        .await
        .unwrap();
    assert_eq!(first.config, second.config);
}

#[tokio::test]
async fn test_verify_connection_failure_hides_token() {
    let db = influxdb::new().unwrap();
    let mut config = ConfigMap::new();
    config.insert("host".to_string(), "127.0.0.1".into());
    // Nothing listens on port 1.
    config.insert("port".to_string(), ConfigValue::Int(1));
    config.insert("token".to_string(), MOCK_TOKEN.into());
    config.insert("organization".to_string(), "vault".into());

    let err = db
        .initialize(InitializeRequest {
            config,
            verify_connection: true,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("failed to verify connection"), "{err}");
    assert!(!err.to_string().contains(MOCK_TOKEN));
}

#[tokio::test]
async fn test_missing_required_fields() {
    let db = influxdb::new().unwrap();
    for key in ["host", "token", "organization"] {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), "h".into());
        config.insert("token".to_string(), "t".into());
        config.insert("organization".to_string(), "o".into());
        config.remove(key);
        let err = db
            .initialize(InitializeRequest {
                config,
                verify_connection: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("{key} cannot be empty"));
    }
}

// ============================================================================
// NewUser
// ============================================================================

#[tokio::test]
async fn test_new_user_default_template() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;

    let resp = db
        .new_user(new_user_request("token", "mylongrolenamewithmanycharacters"))
        .await
        .unwrap();

    let shape = Regex::new(r"^v_token_mylongrolenamew_[a-z0-9]{20}_[0-9]{10}$").unwrap();
    assert!(shape.is_match(&resp.username), "{}", resp.username);
    assert_eq!(mock.user_names(), vec![resp.username.clone()]);
    assert_eq!(
        mock.calls(),
        vec![
            "POST /api/v2/users".to_string(),
            "POST /api/v2/users/u1/password".to_string(),
            "GET /api/v2/orgs?org=vault".to_string(),
            format!("POST /api/v2/orgs/{MOCK_ORG_ID}/members"),
        ]
    );
    assert_eq!(mock.bad_auth_count(), 0);
}

#[tokio::test]
async fn test_new_user_custom_template() {
    let mock = MockInflux::start().await;
    let db = influxdb::new().unwrap();
    let mut config = mock.config();
    config.insert(
        "username_template".to_string(),
        "{{.DisplayName}}_{{random 10}}".into(),
    );
    db.initialize(InitializeRequest {
        config,
        verify_connection: false,
    })
    .await
    .unwrap();

    let resp = db.new_user(new_user_request("token", "role")).await.unwrap();
    assert!(Regex::new(r"^token_[a-zA-Z0-9]{10}$")
        .unwrap()
        .is_match(&resp.username));
}

#[tokio::test]
async fn test_new_user_rolls_back_when_org_step_fails() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    mock.fail_add_member(true);

    let err = db
        .new_user(new_user_request("token", "role"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to add user to organization"), "{err}");
    assert!(!err.to_string().contains(MOCK_TOKEN));

    let deletes: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("DELETE "))
        .collect();
    assert_eq!(deletes, vec!["DELETE /api/v2/users/u1".to_string()]);
    assert!(mock.user_names().is_empty());
}

#[tokio::test]
async fn test_new_user_rejects_other_credential_types() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    let mut req = new_user_request("token", "role");
    req.credential_type = CredentialType::RsaPrivateKey;
    req.public_key = b"-----BEGIN PUBLIC KEY-----".to_vec();

    let err = db.new_user(req).await.unwrap_err();
    assert!(err.to_string().contains("unsupported credential type"));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_new_user_calls_are_serialised() {
    let mock = MockInflux::start().await;
    mock.delay_create(Duration::from_millis(50));
    let db = initialized(&mock).await;

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let db = Arc::clone(&db);
            tokio::spawn(async move { db.new_user(new_user_request("token", &format!("r{i}"))).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(mock.max_in_flight(), 1);

    // Each creation is followed by its own password, org lookup and membership.
    let calls = mock.calls();
    assert_eq!(calls.len(), 16);
    for chunk in calls.chunks(4) {
        assert_eq!(chunk[0], "POST /api/v2/users");
        assert!(chunk[1].ends_with("/password"));
        assert!(chunk[2].starts_with("GET /api/v2/orgs"));
        assert!(chunk[3].ends_with("/members"));
    }
}

#[tokio::test]
async fn test_uninitialized_adapter() {
    let db = influxdb::new().unwrap();
    let err = db.new_user(new_user_request("a", "b")).await.unwrap_err();
    assert!(err.to_string().contains("not been initialized"));
}

// ============================================================================
// UpdateUser / DeleteUser
// ============================================================================

#[tokio::test]
async fn test_update_password() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    let user = db.new_user(new_user_request("token", "role")).await.unwrap();

    db.update_user(UpdateUserRequest {
        username: user.username.clone(),
        password: Some(ChangePassword {
            new_password: "rotated".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    })
    .await
    .unwrap();

    let calls = mock.calls();
    assert_eq!(calls[calls.len() - 2], format!("GET /api/v2/users?name={}", user.username));
    assert_eq!(calls[calls.len() - 1], "POST /api/v2/users/u1/password");
}

#[tokio::test]
async fn test_update_expiration_only_touches_nothing() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;

    db.update_user(UpdateUserRequest {
        username: "someone".to_string(),
        expiration: Some(ChangeExpiration {
            new_expiration: chrono::Utc::now() + chrono::Duration::hours(1),
            statements: Default::default(),
        }),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(mock.calls().is_empty());
}

fn expiration_in_an_hour() -> Option<ChangeExpiration> {
    Some(ChangeExpiration {
        new_expiration: chrono::Utc::now() + chrono::Duration::hours(1),
        statements: Default::default(),
    })
}

#[tokio::test]
async fn test_update_with_empty_password_keeps_password() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    let user = db.new_user(new_user_request("token", "role")).await.unwrap();
    let before = mock.calls().len();

    db.update_user(UpdateUserRequest {
        username: user.username.clone(),
        password: Some(ChangePassword::default()),
        expiration: expiration_in_an_hour(),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(mock.calls().len(), before);

    let err = db
        .update_user(UpdateUserRequest {
            username: user.username,
            password: Some(ChangePassword::default()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no changes requested");
    assert_eq!(mock.calls().len(), before);
}

#[tokio::test]
async fn test_empty_credentials_over_rpc_never_reach_database() {
    let mock = MockInflux::start().await;
    let server = Arc::new(DatabaseServer::new(influxdb::new().unwrap()));
    let client = DatabaseClient::new(
        Arc::new(LoopbackTransport::new(server)),
        ShutdownSignal::never(),
    );
    client
        .initialize(InitializeRequest {
            config: mock.config(),
            verify_connection: true,
        })
        .await
        .unwrap();
    let user = client
        .new_user(new_user_request("t", "r"))
        .await
        .unwrap();
    let before = mock.calls().len();

    client
        .update_user(UpdateUserRequest {
            username: user.username.clone(),
            password: Some(ChangePassword::default()),
            expiration: expiration_in_an_hour(),
            ..Default::default()
        })
        .await
        .unwrap();
    client
        .update_user(UpdateUserRequest {
            username: user.username,
            public_key: Some(ChangePublicKey::default()),
            expiration: expiration_in_an_hour(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(mock.calls().len(), before, "{:?}", mock.calls());
}

#[tokio::test]
async fn test_delete_user() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    let user = db.new_user(new_user_request("token", "role")).await.unwrap();

    db.delete_user(DeleteUserRequest {
        username: user.username.clone(),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(mock.user_names().is_empty());

    let err = db
        .delete_user(DeleteUserRequest {
            username: user.username,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");
}

#[tokio::test]
async fn test_close_forgets_connection() {
    let mock = MockInflux::start().await;
    let db = initialized(&mock).await;
    db.close().await.unwrap();
    assert!(db.new_user(new_user_request("a", "b")).await.is_err());
    assert_eq!(db.type_name().await.unwrap(), "influxdb");
}
