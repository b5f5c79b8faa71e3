//! # Custom Resource Definition
//!
//! The `OpenSearch` custom resource describes a desired OpenSearch cluster.
//! The operator derives a StatefulSet, Services, a security ConfigMap,
//! credential/certificate Secrets and a Dashboards Deployment from it, and
//! reports observed health back through the status subresource.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// OpenSearch Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: opensearch.reclaim-the-stack.com/v1alpha1
/// kind: OpenSearch
/// metadata:
///   name: example
///   namespace: default
/// spec:
///   image: opensearchproject/opensearch:3.1.0
///   replicas: 3
///   diskSize: 10Gi
///   resources:
///     limits:
///       memory: 4Gi
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "OpenSearch",
    group = "opensearch.reclaim-the-stack.com",
    version = "v1alpha1",
    plural = "opensearches",
    namespaced,
    status = "OpenSearchStatus",
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".status.nodes"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchSpec {
    /// Container image as `repository:tag`. The tag doubles as the OpenSearch
    /// version, used to pick the matching prometheus-exporter plugin and the
    /// Dashboards image.
    pub image: String,
    /// Number of OpenSearch nodes. Three is the supported minimum; smaller
    /// topologies cannot form a quorum with the generated configuration.
    pub replicas: i32,
    /// Size of the per-node persistent volume claim, e.g. `10Gi`.
    pub disk_size: String,
    /// Compute resources applied to each OpenSearch container. The memory
    /// limit drives the JVM heap computation and must be at least 4Gi.
    pub resources: Resources,
    /// Optional node selector, passed through to the pod template verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<serde_json::Value>,
    /// Optional tolerations, passed through to the pod template verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<serde_json::Value>,
    /// Free-form settings merged into `opensearch.yml` on startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, serde_json::Value>>,
    /// S3 snapshot repositories and their snapshot-management policies,
    /// reconciled against the cluster once it reports green.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_repositories: Vec<SnapshotRepository>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory limit as a Kubernetes quantity, e.g. `4Gi`.
    pub memory: String,
    /// Optional CPU limit, passed through to the container verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

/// An S3 bucket registered as an OpenSearch snapshot repository.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRepository {
    /// Repository name, also used as the S3 client name in the keystore.
    pub name: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    /// AWS region, defaults to `us-east-1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// S3 endpoint, defaults to `s3.<region>.amazonaws.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// `https` (default) or `http`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub access_key_id: SecretKeyRef,
    pub secret_access_key: SecretKeyRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<SnapshotPolicy>,
}

/// A scheduled backup + retention rule, reconciled as an OpenSearch
/// snapshot-management policy named `<repository>-<name>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPolicy {
    pub name: String,
    /// Cron expression, evaluated in UTC.
    pub schedule: String,
    /// Snapshot retention, e.g. `7d`.
    pub max_age: String,
}

/// Reference to a key in a Kubernetes Secret in the cluster's namespace.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Observed cluster health, written to the status subresource only when one
/// of the fields actually changed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchStatus {
    /// Capitalized cluster color: `Green`, `Yellow` or `Red`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl OpenSearch {
    /// `opensearch-<name>`, the base name of every owned child resource.
    pub fn base_name(&self) -> String {
        format!("opensearch-{}", self.name_any())
    }

    pub fn credentials_secret_name(&self) -> String {
        format!("{}-credentials", self.base_name())
    }

    pub fn certificates_secret_name(&self) -> String {
        format!("{}-certificates", self.base_name())
    }

    pub fn security_config_name(&self) -> String {
        format!("{}-security-config", self.base_name())
    }

    pub fn dashboards_name(&self) -> String {
        format!("{}-dashboards", self.base_name())
    }

    /// The OpenSearch version, read from the image tag.
    pub fn version(&self) -> Result<&str> {
        self.spec
            .image
            .rsplit_once(':')
            .map(|(_, tag)| tag)
            .ok_or_else(|| Error::MissingImageTag(self.spec.image.clone()))
    }

    /// REST endpoint of the managed service. Plain HTTP: the generated
    /// certificates secure the transport layer only. `CLUSTER_HOST_OVERRIDE`
    /// substitutes the host for out-of-cluster testing.
    pub fn rest_url(&self) -> String {
        let host = std::env::var("CLUSTER_HOST_OVERRIDE").unwrap_or_else(|_| {
            format!(
                "{}.{}.svc.cluster.local",
                self.base_name(),
                self.namespace().unwrap_or_else(|| "default".into())
            )
        });
        format!("http://{host}:9200")
    }

    /// `metadata.creationTimestamp` as a unix epoch. Baked into the pod
    /// template so that recreating a cluster under the same name forces a
    /// rollout, while ordinary reconciles leave the template unchanged.
    pub fn creation_epoch(&self) -> i64 {
        self.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.timestamp())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OpenSearch {
        serde_yaml::from_str(
            r#"
apiVersion: opensearch.reclaim-the-stack.com/v1alpha1
kind: OpenSearch
metadata:
  name: example
  namespace: default
  uid: u1
  creationTimestamp: "2024-05-01T12:00:00Z"
spec:
  image: opensearchproject/opensearch:3.1.0
  replicas: 3
  diskSize: 5Gi
  resources:
    limits:
      memory: 4Gi
"#,
        )
        .expect("sample manifest should deserialize")
    }

    #[test]
    fn test_child_resource_names() {
        let cluster = sample();
        assert_eq!(cluster.base_name(), "opensearch-example");
        assert_eq!(
            cluster.credentials_secret_name(),
            "opensearch-example-credentials"
        );
        assert_eq!(
            cluster.certificates_secret_name(),
            "opensearch-example-certificates"
        );
        assert_eq!(
            cluster.security_config_name(),
            "opensearch-example-security-config"
        );
        assert_eq!(cluster.dashboards_name(), "opensearch-example-dashboards");
    }

    #[test]
    fn test_version_from_image_tag() {
        let cluster = sample();
        assert_eq!(cluster.version().unwrap(), "3.1.0");
    }

    #[test]
    fn test_version_requires_tag() {
        let mut cluster = sample();
        cluster.spec.image = "opensearchproject/opensearch".into();
        assert!(cluster.version().is_err());
    }

    #[test]
    fn test_creation_epoch() {
        let cluster = sample();
        assert_eq!(cluster.creation_epoch(), 1714564800);
    }

    #[test]
    fn test_snapshot_repository_deserialization() {
        let repo: SnapshotRepository = serde_yaml::from_str(
            r#"
name: backup
bucket: my-bucket
basePath: clusters/example
accessKeyId:
  name: s3-credentials
  key: access-key-id
secretAccessKey:
  name: s3-credentials
  key: secret-access-key
policies:
  - name: nightly
    schedule: "0 3 * * *"
    maxAge: 14d
"#,
        )
        .expect("snapshot repository should deserialize");

        assert_eq!(repo.name, "backup");
        assert_eq!(repo.base_path.as_deref(), Some("clusters/example"));
        assert_eq!(repo.region, None);
        assert_eq!(repo.policies.len(), 1);
        assert_eq!(repo.policies[0].max_age, "14d");
    }
}
