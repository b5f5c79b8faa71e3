//! # Credentials
//!
//! Passwords for the seven internal OpenSearch users, the operator-global
//! shared `metrics` password, and the bcrypt hashes rendered into
//! `internal_users.yml`.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{Error, Result};
use crate::k8s::Applier;

/// Internal users provisioned into every cluster. `metrics` shares one
/// password across all clusters so a single Prometheus scrape config works
/// fleet-wide.
pub const INTERNAL_USERS: [&str; 7] = [
    "admin",
    "kibanaserver",
    "kibanaro",
    "logstash",
    "readall",
    "snapshotrestore",
    "metrics",
];

/// Operator-global Secret holding the shared `metrics` password.
pub const METRICS_SECRET_NAME: &str = "opensearch-metrics-basic-auth";
const METRICS_SECRET_KEY: &str = "password";

/// 32 hex characters from 16 random bytes.
pub fn random_hex_password() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(32), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Fresh passwords for all internal users; `metrics` is the shared one.
pub fn generate_passwords(metrics_password: &str) -> BTreeMap<&'static str, String> {
    INTERNAL_USERS
        .iter()
        .map(|user| {
            let password = if *user == "metrics" {
                metrics_password.to_string()
            } else {
                random_hex_password()
            };
            (*user, password)
        })
        .collect()
}

/// Reads every internal-user password back out of the credentials Secret.
pub fn passwords_from_secret(secret: &Secret) -> Result<BTreeMap<&'static str, String>> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let data = secret.data.as_ref().ok_or_else(|| Error::MissingSecretKey {
        secret: name.clone(),
        key: "data".into(),
    })?;

    INTERNAL_USERS
        .iter()
        .map(|user| {
            let bytes = data.get(*user).ok_or_else(|| Error::MissingSecretKey {
                secret: name.clone(),
                key: (*user).into(),
            })?;
            let password =
                String::from_utf8(bytes.0.clone()).map_err(|_| Error::MissingSecretKey {
                    secret: name.clone(),
                    key: (*user).into(),
                })?;
            Ok((*user, password))
        })
        .collect()
}

/// Bcrypt hashes keyed as `<user>_hash`, the variable names the
/// `_internal_users` template expects.
pub fn password_hashes(
    passwords: &BTreeMap<&'static str, String>,
) -> Result<BTreeMap<&'static str, String>> {
    INTERNAL_USERS
        .iter()
        .map(|user| {
            let password = passwords.get(user).ok_or_else(|| Error::MissingSecretKey {
                secret: "credentials".into(),
                key: (*user).into(),
            })?;
            let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
            Ok((hash_key(user), hash))
        })
        .collect()
}

fn hash_key(user: &str) -> &'static str {
    match user {
        "admin" => "admin_hash",
        "kibanaserver" => "kibanaserver_hash",
        "kibanaro" => "kibanaro_hash",
        "logstash" => "logstash_hash",
        "readall" => "readall_hash",
        "snapshotrestore" => "snapshotrestore_hash",
        "metrics" => "metrics_hash",
        other => unreachable!("unknown internal user {other}"),
    }
}

/// The shared `metrics` password, fetched or created once per process and
/// memoized for every later cluster reconcile.
#[derive(Debug, Default)]
pub struct SharedMetricsPassword {
    cell: OnceCell<String>,
}

impl SharedMetricsPassword {
    pub async fn get(&self, applier: &Applier, operator_namespace: &str) -> Result<String> {
        let password = self
            .cell
            .get_or_try_init(|| fetch_or_create(applier, operator_namespace))
            .await?;
        Ok(password.clone())
    }
}

async fn fetch_or_create(applier: &Applier, namespace: &str) -> Result<String> {
    if let Some(secret) = applier.get_secret(namespace, METRICS_SECRET_NAME).await? {
        return metrics_password_from(&secret);
    }

    info!(namespace, "creating shared metrics password secret");
    let password = random_hex_password();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(METRICS_SECRET_NAME.into()),
            namespace: Some(namespace.into()),
            ..ObjectMeta::default()
        },
        string_data: Some(BTreeMap::from([(
            METRICS_SECRET_KEY.to_string(),
            password,
        )])),
        ..Secret::default()
    };
    // create_secret resolves the create/create race by reading the winner.
    let stored = applier.create_secret(namespace, secret).await?;
    match stored.data.as_ref() {
        Some(_) => metrics_password_from(&stored),
        // A freshly created secret echoes stringData back before the
        // apiserver re-encodes it.
        None => stored
            .string_data
            .as_ref()
            .and_then(|data| data.get(METRICS_SECRET_KEY))
            .cloned()
            .ok_or_else(|| Error::MissingSecretKey {
                secret: METRICS_SECRET_NAME.into(),
                key: METRICS_SECRET_KEY.into(),
            }),
    }
}

fn metrics_password_from(secret: &Secret) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(METRICS_SECRET_KEY))
        .ok_or_else(|| Error::MissingSecretKey {
            secret: METRICS_SECRET_NAME.into(),
            key: METRICS_SECRET_KEY.into(),
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| Error::MissingSecretKey {
        secret: METRICS_SECRET_NAME.into(),
        key: METRICS_SECRET_KEY.into(),
    })
}
