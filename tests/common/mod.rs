//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value, json};

use tool_gate::audit::MemorySink;
use tool_gate::auth::Role;
use tool_gate::config::Config;
use tool_gate::gateway::Gateway;
use tool_gate::policy::PolicyRule;

pub const DEV_KID: &str = "dev-key-1";
pub const ROTATED_KID: &str = "rotated-key-2";
pub const AUDIENCE: &str = "tool-gate";
pub const ISSUER: &str = "http://localhost/dev";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Sign `claims` with the fixture key for `kid`.
pub fn sign_with(kid: &str, claims: &Value) -> String {
    let pem = match kid {
        ROTATED_KID => include_bytes!("../fixtures/rotated_signing_key.pem").as_slice(),
        _ => include_bytes!("../fixtures/dev_signing_key.pem").as_slice(),
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem).expect("fixture key");
    jsonwebtoken::encode(&header, claims, &key).expect("sign")
}

/// Sign with the dev key.
pub fn sign(claims: &Value) -> String {
    sign_with(DEV_KID, claims)
}

/// Valid claims for `sub` carrying `roles`, expiring ten minutes after `now`.
pub fn claims_for(sub: &str, roles: &[&str], now: DateTime<Utc>) -> Value {
    json!({
        "sub": sub,
        "aud": AUDIENCE,
        "iss": ISSUER,
        "iat": now.timestamp(),
        "exp": now.timestamp() + 600,
        "email": format!("{sub}@example.com"),
        "roles": roles,
    })
}

pub fn token_for(sub: &str, roles: &[&str], now: DateTime<Utc>) -> String {
    sign(&claims_for(sub, roles, now))
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Local-mode config over the dev JWKS with the network tool rules.
pub fn config(write_enabled: bool) -> Config {
    let mut config = Config::default();
    config.auth.local.jwks_path = fixture("dev_jwks.json");
    config.policy.write_enabled = write_enabled;
    config.policy.tools = vec![
        PolicyRule::read("mist_call_get", Role::ReadOnly).with_site_param("site_id"),
        PolicyRule::read("mistql_observe", Role::ReadOnly),
        PolicyRule::mutating("configure_switch_port_profile", Role::ReadOnly).with_site_param("site_id"),
        PolicyRule::mutating("bounce_device_port", Role::ReadOnly).with_site_param("site_id"),
        PolicyRule::mutating("create_site", Role::ReadOnly),
        PolicyRule::mutating("acknowledge_alarm", Role::ReadOnly).with_site_param("site_id"),
        PolicyRule::mutating("mist_call_write", Role::ReadWrite).with_site_param("site_id"),
    ];
    config
}

/// Gateway over `config` writing audit entries to a returned memory sink.
pub fn gateway(config: &Config) -> (Gateway, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let gateway = Gateway::from_config_with_sink(config, sink.clone()).expect("gateway");
    (gateway, sink)
}
