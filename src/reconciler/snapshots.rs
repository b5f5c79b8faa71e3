//! # Snapshot Repositories and Snapshot-Management Policies
//!
//! Reconciles `spec.snapshotRepositories` against a running cluster: upserts
//! the S3 repository, then three-way diffs the snapshot-management policies
//! (create / rewrite / delete orphans) under optimistic concurrency tokens.
//!
//! Runs from the health watcher's one-shot green callback, so it never
//! overlaps with itself for the same cluster.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::crd::{SnapshotPolicy, SnapshotRepository};
use crate::error::{Error, Result};
use crate::metrics;

/// A snapshot repository with the optional S3 fields resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRepository {
    pub name: String,
    pub bucket: String,
    pub base_path: Option<String>,
    pub region: String,
    pub endpoint: String,
    pub protocol: String,
    pub access_key_id: crate::crd::SecretKeyRef,
    pub secret_access_key: crate::crd::SecretKeyRef,
    pub policies: Vec<SnapshotPolicy>,
}

pub fn normalize_repositories(repositories: &[SnapshotRepository]) -> Vec<NormalizedRepository> {
    repositories
        .iter()
        .map(|repo| {
            let region = repo.region.clone().unwrap_or_else(|| "us-east-1".into());
            let endpoint = repo
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("s3.{region}.amazonaws.com"));
            let protocol = repo.protocol.clone().unwrap_or_else(|| "https".into());
            NormalizedRepository {
                name: repo.name.clone(),
                bucket: repo.bucket.clone(),
                base_path: repo.base_path.clone(),
                region,
                endpoint,
                protocol,
                access_key_id: repo.access_key_id.clone(),
                secret_access_key: repo.secret_access_key.clone(),
                policies: repo.policies.clone(),
            }
        })
        .collect()
}

/// Everything the green callback needs to converge snapshot configuration.
#[derive(Debug, Clone)]
pub struct SnapshotPlan {
    pub base_url: String,
    pub admin_password: String,
    pub repositories: Vec<NormalizedRepository>,
}

/// `PUT /_snapshot/<repo>` body. `hashed_infix` shard paths let multiple
/// clusters share one bucket.
pub fn repository_document(repo: &NormalizedRepository) -> Value {
    let mut settings = json!({
        "bucket": repo.bucket,
        "client": repo.name,
        "shard_path_type": "hashed_infix",
    });
    if let Some(base_path) = &repo.base_path {
        settings["base_path"] = json!(base_path);
    }
    json!({ "type": "s3", "settings": settings })
}

/// Snapshot-management policy document for `<repo>-<policy>`.
pub fn policy_document(repository: &str, policy: &SnapshotPolicy) -> Value {
    json!({
        "creation": {
            "schedule": {
                "cron": { "expression": policy.schedule, "timezone": "UTC" }
            }
        },
        "deletion": {
            "condition": { "max_age": policy.max_age }
        },
        "snapshot_config": {
            "repository": repository,
            "include_global_state": false,
            "indices": "*,-.opendistro_security"
        }
    })
}

pub fn policy_name(repository: &str, policy: &SnapshotPolicy) -> String {
    format!("{repository}-{}", policy.name)
}

#[derive(Debug, Deserialize)]
struct PolicyList {
    #[serde(default)]
    policies: Vec<ExistingPolicy>,
}

#[derive(Debug, Deserialize)]
struct ExistingPolicy {
    #[serde(rename = "_seq_no")]
    seq_no: i64,
    #[serde(rename = "_primary_term")]
    primary_term: i64,
    sm_policy: SmPolicy,
}

#[derive(Debug, Deserialize)]
struct SmPolicy {
    name: String,
    #[serde(default)]
    snapshot_config: SmSnapshotConfig,
}

#[derive(Debug, Default, Deserialize)]
struct SmSnapshotConfig {
    #[serde(default)]
    repository: Option<String>,
}

#[derive(Debug, PartialEq)]
enum PolicyAction {
    Create {
        name: String,
        document: Value,
    },
    /// Existing policies are always rewritten: OpenSearch normalizes stored
    /// fields (`24h` becomes `1d`), so equality against the spec is not a
    /// reliable skip condition.
    Update {
        name: String,
        document: Value,
        seq_no: i64,
        primary_term: i64,
    },
    Delete {
        name: String,
    },
}

fn plan_policy_actions(repo: &NormalizedRepository, existing: &[ExistingPolicy]) -> Vec<PolicyAction> {
    let mut actions = Vec::new();
    let desired: Vec<String> = repo
        .policies
        .iter()
        .map(|p| policy_name(&repo.name, p))
        .collect();

    for policy in &repo.policies {
        let name = policy_name(&repo.name, policy);
        let document = policy_document(&repo.name, policy);
        let current = existing.iter().find(|e| {
            e.sm_policy.name == name
                && e.sm_policy.snapshot_config.repository.as_deref() == Some(repo.name.as_str())
        });
        match current {
            Some(current) => actions.push(PolicyAction::Update {
                name,
                document,
                seq_no: current.seq_no,
                primary_term: current.primary_term,
            }),
            None => actions.push(PolicyAction::Create { name, document }),
        }
    }

    for orphan in existing.iter().filter(|e| {
        e.sm_policy.snapshot_config.repository.as_deref() == Some(repo.name.as_str())
            && !desired.contains(&e.sm_policy.name)
    }) {
        actions.push(PolicyAction::Delete {
            name: orphan.sm_policy.name.clone(),
        });
    }

    actions
}

async fn ensure_success(response: reqwest::Response, path: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(Error::OpenSearchApi {
        path: path.to_string(),
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}

async fn fetch_policies(http: &reqwest::Client, plan: &SnapshotPlan) -> Result<Vec<ExistingPolicy>> {
    let path = format!("{}/_plugins/_sm/policies", plan.base_url);
    let response = http
        .get(&path)
        .basic_auth("admin", Some(&plan.admin_password))
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::OpenSearchApi {
            path,
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    let list: PolicyList = response.json().await?;
    Ok(list.policies)
}

async fn reconcile_repository(
    http: &reqwest::Client,
    plan: &SnapshotPlan,
    repo: &NormalizedRepository,
    existing: &[ExistingPolicy],
) -> Result<()> {
    let path = format!("{}/_snapshot/{}", plan.base_url, repo.name);
    let response = http
        .put(&path)
        .basic_auth("admin", Some(&plan.admin_password))
        .json(&repository_document(repo))
        .send()
        .await?;
    ensure_success(response, &path).await?;

    for action in plan_policy_actions(repo, existing) {
        match action {
            PolicyAction::Create { name, document } => {
                let path = format!("{}/_plugins/_sm/policies/{name}", plan.base_url);
                let response = http
                    .post(&path)
                    .basic_auth("admin", Some(&plan.admin_password))
                    .json(&document)
                    .send()
                    .await?;
                ensure_success(response, &path).await?;
                info!(repository = %repo.name, policy = %name, "created snapshot policy");
            }
            PolicyAction::Update {
                name,
                document,
                seq_no,
                primary_term,
            } => {
                let path = format!(
                    "{}/_plugins/_sm/policies/{name}?if_seq_no={seq_no}&if_primary_term={primary_term}",
                    plan.base_url
                );
                let response = http
                    .put(&path)
                    .basic_auth("admin", Some(&plan.admin_password))
                    .json(&document)
                    .send()
                    .await?;
                ensure_success(response, &path).await?;
                info!(repository = %repo.name, policy = %name, "updated snapshot policy");
            }
            PolicyAction::Delete { name } => {
                let path = format!("{}/_plugins/_sm/policies/{name}", plan.base_url);
                let response = http
                    .delete(&path)
                    .basic_auth("admin", Some(&plan.admin_password))
                    .send()
                    .await?;
                ensure_success(response, &path).await?;
                info!(repository = %repo.name, policy = %name, "deleted orphaned snapshot policy");
            }
        }
    }

    Ok(())
}

/// Converges every repository in the plan. Per-repository failures are
/// logged and do not block the remaining repositories.
pub async fn reconcile_repositories(http: &reqwest::Client, plan: &SnapshotPlan) -> Result<()> {
    if plan.repositories.is_empty() {
        return Ok(());
    }

    let existing = fetch_policies(http, plan).await?;
    for repo in &plan.repositories {
        if let Err(err) = reconcile_repository(http, plan, repo, &existing).await {
            metrics::increment_snapshot_errors();
            error!(repository = %repo.name, error = %err, "snapshot repository reconciliation failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyRef;

    fn repository(policies: &[(&str, &str, &str)]) -> NormalizedRepository {
        normalize_repositories(&[SnapshotRepository {
            name: "backup".into(),
            bucket: "my-bucket".into(),
            base_path: Some("clusters/example".into()),
            region: None,
            endpoint: None,
            protocol: None,
            access_key_id: SecretKeyRef {
                name: "s3".into(),
                key: "id".into(),
            },
            secret_access_key: SecretKeyRef {
                name: "s3".into(),
                key: "secret".into(),
            },
            policies: policies
                .iter()
                .map(|(name, schedule, max_age)| SnapshotPolicy {
                    name: (*name).into(),
                    schedule: (*schedule).into(),
                    max_age: (*max_age).into(),
                })
                .collect(),
        }])
        .remove(0)
    }

    fn existing_fixture() -> Vec<ExistingPolicy> {
        let body = r#"{
            "policies": [
                {
                    "_id": "backup-nightly-sm-policy",
                    "_seq_no": 7,
                    "_primary_term": 2,
                    "sm_policy": {
                        "name": "backup-nightly",
                        "snapshot_config": {"repository": "backup"}
                    }
                },
                {
                    "_id": "backup-stale-sm-policy",
                    "_seq_no": 3,
                    "_primary_term": 1,
                    "sm_policy": {
                        "name": "backup-stale",
                        "snapshot_config": {"repository": "backup"}
                    }
                },
                {
                    "_id": "other-nightly-sm-policy",
                    "_seq_no": 9,
                    "_primary_term": 1,
                    "sm_policy": {
                        "name": "other-nightly",
                        "snapshot_config": {"repository": "other"}
                    }
                }
            ],
            "total_policies": 3
        }"#;
        let list: PolicyList = serde_json::from_str(body).expect("policy list fixture");
        list.policies
    }

    #[test]
    fn test_normalization_defaults() {
        let repo = repository(&[]);
        assert_eq!(repo.region, "us-east-1");
        assert_eq!(repo.endpoint, "s3.us-east-1.amazonaws.com");
        assert_eq!(repo.protocol, "https");
    }

    #[test]
    fn test_normalization_endpoint_follows_region() {
        let mut spec = SnapshotRepository {
            name: "backup".into(),
            bucket: "b".into(),
            base_path: None,
            region: Some("eu-north-1".into()),
            endpoint: None,
            protocol: None,
            access_key_id: SecretKeyRef {
                name: "s3".into(),
                key: "id".into(),
            },
            secret_access_key: SecretKeyRef {
                name: "s3".into(),
                key: "secret".into(),
            },
            policies: vec![],
        };
        let repo = normalize_repositories(std::slice::from_ref(&spec)).remove(0);
        assert_eq!(repo.endpoint, "s3.eu-north-1.amazonaws.com");

        spec.endpoint = Some("minio.internal:9000".into());
        spec.protocol = Some("http".into());
        let repo = normalize_repositories(&[spec]).remove(0);
        assert_eq!(repo.endpoint, "minio.internal:9000");
        assert_eq!(repo.protocol, "http");
    }

    #[test]
    fn test_repository_document() {
        let document = repository_document(&repository(&[]));
        assert_eq!(document["type"], "s3");
        assert_eq!(document["settings"]["bucket"], "my-bucket");
        assert_eq!(document["settings"]["client"], "backup");
        assert_eq!(document["settings"]["shard_path_type"], "hashed_infix");
        assert_eq!(document["settings"]["base_path"], "clusters/example");

        let mut without_base = repository(&[]);
        without_base.base_path = None;
        let document = repository_document(&without_base);
        assert!(document["settings"].get("base_path").is_none());
    }

    #[test]
    fn test_policy_document_shape() {
        let policy = SnapshotPolicy {
            name: "nightly".into(),
            schedule: "0 3 * * *".into(),
            max_age: "14d".into(),
        };
        let document = policy_document("backup", &policy);
        assert_eq!(
            document["creation"]["schedule"]["cron"]["expression"],
            "0 3 * * *"
        );
        assert_eq!(document["creation"]["schedule"]["cron"]["timezone"], "UTC");
        assert_eq!(document["deletion"]["condition"]["max_age"], "14d");
        assert_eq!(document["snapshot_config"]["repository"], "backup");
        assert_eq!(document["snapshot_config"]["include_global_state"], false);
        assert_eq!(
            document["snapshot_config"]["indices"],
            "*,-.opendistro_security"
        );
    }

    #[test]
    fn test_plan_updates_existing_creates_new_deletes_orphans() {
        let repo = repository(&[("nightly", "0 3 * * *", "14d"), ("hourly", "0 * * * *", "1d")]);
        let actions = plan_policy_actions(&repo, &existing_fixture());

        assert_eq!(actions.len(), 3);
        match &actions[0] {
            PolicyAction::Update {
                name,
                seq_no,
                primary_term,
                ..
            } => {
                assert_eq!(name, "backup-nightly");
                assert_eq!(*seq_no, 7);
                assert_eq!(*primary_term, 2);
            }
            other => panic!("expected update, got {other:?}"),
        }
        match &actions[1] {
            PolicyAction::Create { name, .. } => assert_eq!(name, "backup-hourly"),
            other => panic!("expected create, got {other:?}"),
        }
        match &actions[2] {
            PolicyAction::Delete { name } => assert_eq!(name, "backup-stale"),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_ignores_other_repositories() {
        // "other-nightly" belongs to a different repository and must survive.
        let repo = repository(&[]);
        let actions = plan_policy_actions(&repo, &existing_fixture());
        assert_eq!(
            actions,
            vec![
                PolicyAction::Delete {
                    name: "backup-nightly".into()
                },
                PolicyAction::Delete {
                    name: "backup-stale".into()
                }
            ]
        );
    }

    #[test]
    fn test_existing_policies_are_always_rewritten() {
        // Same spec as stored: still an Update, never a skip.
        let repo = repository(&[("nightly", "0 3 * * *", "14d")]);
        let actions = plan_policy_actions(&repo, &existing_fixture());
        assert!(matches!(actions[0], PolicyAction::Update { .. }));
    }
}
