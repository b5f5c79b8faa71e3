//! # Child-Resource Contexts
//!
//! Builds the variable sets the manifest templates are rendered with:
//! owner references, the StatefulSet context (heap, exporter plugin,
//! pass-through scheduling fields) and the startup-script fragments that
//! merge `spec.config` and the S3 client settings into `opensearch.yml`.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::crd::OpenSearch;
use crate::error::{Error, Result};
use crate::quantity::jvm_heap_megabytes;
use crate::reconciler::snapshots::NormalizedRepository;

use kube::{Resource, ResourceExt};

/// The single controller ownerReference carried by every child resource.
/// Kubernetes garbage collection cascades deletes through it.
pub fn owner_reference(cluster: &OpenSearch) -> Result<Value> {
    let uid = cluster
        .uid()
        .ok_or(Error::IncompleteManifest("metadata.uid"))?;
    Ok(json!({
        "apiVersion": OpenSearch::api_version(&()),
        "kind": OpenSearch::kind(&()),
        "name": cluster.name_any(),
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    }))
}

/// Variables every manifest template receives.
pub fn common_vars(cluster: &OpenSearch) -> Result<BTreeMap<&'static str, String>> {
    let mut vars = BTreeMap::new();
    vars.insert("name", cluster.name_any());
    vars.insert(
        "namespace",
        cluster.namespace().unwrap_or_else(|| "default".into()),
    );
    vars.insert("owner_reference", owner_reference(cluster)?.to_string());
    Ok(vars)
}

/// The prometheus-exporter plugin tracks OpenSearch versions as
/// `<opensearch-version>.0`.
pub fn exporter_plugin_version(opensearch_version: &str) -> String {
    format!("{opensearch_version}.0")
}

/// `opensearch.yml` content appended by the startup script: baseline
/// cluster/security settings, then `spec.config` (which may override any
/// baseline key), then the S3 client settings for each snapshot repository.
pub fn opensearch_config_yaml(
    cluster: &OpenSearch,
    repositories: &[NormalizedRepository],
) -> Result<String> {
    let base_name = cluster.base_name();
    let mut settings: BTreeMap<String, Value> = BTreeMap::from([
        ("cluster.name".into(), json!(base_name)),
        ("network.host".into(), json!("0.0.0.0")),
        ("discovery.seed_hosts".into(), json!([base_name])),
        (
            "plugins.security.ssl.transport.pemcert_filepath".into(),
            json!("certificates/node.pem"),
        ),
        (
            "plugins.security.ssl.transport.pemkey_filepath".into(),
            json!("certificates/node-key.pem"),
        ),
        (
            "plugins.security.ssl.transport.pemtrustedcas_filepath".into(),
            json!("certificates/ca.pem"),
        ),
        // The node certificate only carries localhost SANs.
        (
            "plugins.security.ssl.transport.enforce_hostname_verification".into(),
            json!(false),
        ),
        ("plugins.security.ssl.http.enabled".into(), json!(false)),
        (
            "plugins.security.allow_default_init_securityindex".into(),
            json!(true),
        ),
        ("plugins.security.authcz.admin_dn".into(), json!(["CN=admin"])),
        (
            "plugins.security.nodes_dn".into(),
            json!(["CN=opensearch-node"]),
        ),
        (
            "plugins.security.restapi.roles_enabled".into(),
            json!(["all_access"]),
        ),
    ]);

    if let Some(config) = &cluster.spec.config {
        for (key, value) in config {
            settings.insert(key.clone(), value.clone());
        }
    }

    for repo in repositories {
        settings.insert(
            format!("s3.client.{}.endpoint", repo.name),
            json!(repo.endpoint),
        );
        settings.insert(
            format!("s3.client.{}.protocol", repo.name),
            json!(repo.protocol),
        );
        settings.insert(format!("s3.client.{}.region", repo.name), json!(repo.region));
    }

    Ok(serde_yaml::to_string(&settings)?)
}

fn env_var_prefix(repository: &str) -> String {
    let sanitized: String = repository
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("OPENSEARCH_S3_{sanitized}")
}

/// Shell lines loading each repository's S3 credentials from the pod
/// environment into the OpenSearch keystore.
pub fn keystore_setup_script(repositories: &[NormalizedRepository]) -> String {
    repositories
        .iter()
        .flat_map(|repo| {
            let prefix = env_var_prefix(&repo.name);
            [
                format!(
                    "echo \"${prefix}_ACCESS_KEY_ID\" | ./bin/opensearch-keystore add --stdin --force s3.client.{}.access_key",
                    repo.name
                ),
                format!(
                    "echo \"${prefix}_SECRET_ACCESS_KEY\" | ./bin/opensearch-keystore add --stdin --force s3.client.{}.secret_key",
                    repo.name
                ),
            ]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The OpenSearch container environment: node identity plus the S3
/// credential references the keystore setup reads.
pub fn container_env(repositories: &[NormalizedRepository]) -> Value {
    let mut env = vec![json!({
        "name": "NODE_NAME",
        "valueFrom": {"fieldRef": {"fieldPath": "metadata.name"}}
    })];

    for repo in repositories {
        let prefix = env_var_prefix(&repo.name);
        env.push(json!({
            "name": format!("{prefix}_ACCESS_KEY_ID"),
            "valueFrom": {"secretKeyRef": {
                "name": repo.access_key_id.name,
                "key": repo.access_key_id.key,
            }}
        }));
        env.push(json!({
            "name": format!("{prefix}_SECRET_ACCESS_KEY"),
            "valueFrom": {"secretKeyRef": {
                "name": repo.secret_access_key.name,
                "key": repo.secret_access_key.key,
            }}
        }));
    }

    Value::Array(env)
}

fn container_resources(cluster: &OpenSearch) -> Value {
    let mut limits = json!({ "memory": cluster.spec.resources.limits.memory });
    if let Some(cpu) = &cluster.spec.resources.limits.cpu {
        limits["cpu"] = json!(cpu);
    }
    json!({ "limits": limits, "requests": { "memory": cluster.spec.resources.limits.memory } })
}

/// Variables for the `statefulset` template, on top of [`common_vars`].
/// `startup_script` must already be rendered; it embeds as a JSON string.
pub fn statefulset_vars(
    cluster: &OpenSearch,
    repositories: &[NormalizedRepository],
    startup_script: &str,
) -> Result<BTreeMap<&'static str, String>> {
    let mut vars = common_vars(cluster)?;
    vars.insert("image", cluster.spec.image.clone());
    vars.insert("replicas", cluster.spec.replicas.to_string());
    vars.insert("disk_size", cluster.spec.disk_size.clone());
    vars.insert("resources", container_resources(cluster).to_string());
    vars.insert(
        "node_selector",
        cluster
            .spec
            .node_selector
            .clone()
            .unwrap_or_else(|| json!({}))
            .to_string(),
    );
    vars.insert(
        "tolerations",
        cluster
            .spec
            .tolerations
            .clone()
            .unwrap_or_else(|| json!([]))
            .to_string(),
    );
    vars.insert("env", container_env(repositories).to_string());
    vars.insert(
        "startup_script",
        crate::templates::json_string(startup_script),
    );
    vars.insert(
        "creation_timestamp_epoch",
        cluster.creation_epoch().to_string(),
    );
    Ok(vars)
}

/// Variables for the `_startup_script` partial.
pub fn startup_script_vars(
    cluster: &OpenSearch,
    repositories: &[NormalizedRepository],
) -> Result<BTreeMap<&'static str, String>> {
    let version = cluster.version()?;
    let mut vars = BTreeMap::new();
    vars.insert(
        "jvm_heap_mb",
        jvm_heap_megabytes(&cluster.spec.resources.limits.memory)?.to_string(),
    );
    vars.insert("plugin_version", exporter_plugin_version(version));
    vars.insert(
        "extra_config",
        opensearch_config_yaml(cluster, repositories)?,
    );
    vars.insert("keystore_setup", keystore_setup_script(repositories));
    Ok(vars)
}

/// Variables for the Dashboards deployment. The Dashboards image tracks the
/// cluster's OpenSearch version.
pub fn dashboards_vars(cluster: &OpenSearch) -> Result<BTreeMap<&'static str, String>> {
    let mut vars = common_vars(cluster)?;
    vars.insert(
        "dashboards_image",
        format!("opensearchproject/opensearch-dashboards:{}", cluster.version()?),
    );
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SecretKeyRef, SnapshotRepository};
    use crate::reconciler::snapshots::normalize_repositories;

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
        .unwrap()
    }

    fn repositories() -> Vec<NormalizedRepository> {
        normalize_repositories(&[SnapshotRepository {
            name: "backup".into(),
            bucket: "bucket".into(),
            base_path: None,
            region: None,
            endpoint: None,
            protocol: None,
            access_key_id: SecretKeyRef {
                name: "s3-credentials".into(),
                key: "access-key-id".into(),
            },
            secret_access_key: SecretKeyRef {
                name: "s3-credentials".into(),
                key: "secret-access-key".into(),
            },
            policies: vec![],
        }])
    }

    #[test]
    fn test_owner_reference_shape() {
        let owner = owner_reference(&sample()).unwrap();
        assert_eq!(
            owner["apiVersion"],
            "opensearch.reclaim-the-stack.com/v1alpha1"
        );
        assert_eq!(owner["kind"], "OpenSearch");
        assert_eq!(owner["name"], "example");
        assert_eq!(owner["uid"], "u1");
        assert_eq!(owner["controller"], true);
        assert_eq!(owner["blockOwnerDeletion"], true);
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut cluster = sample();
        cluster.metadata.uid = None;
        assert!(owner_reference(&cluster).is_err());
    }

    #[test]
    fn test_exporter_plugin_version() {
        assert_eq!(exporter_plugin_version("3.1.0"), "3.1.0.0");
    }

    #[test]
    fn test_config_yaml_merges_spec_config_over_baseline() {
        let mut cluster = sample();
        cluster.spec.config = Some(BTreeMap::from([
            (
                "cluster.routing.allocation.disk.watermark.low".to_string(),
                serde_json::json!("90%"),
            ),
            ("network.host".to_string(), serde_json::json!("127.0.0.1")),
        ]));

        let yaml = opensearch_config_yaml(&cluster, &[]).unwrap();
        let parsed: BTreeMap<String, serde_json::Value> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["cluster.name"], "opensearch-example");
        assert_eq!(
            parsed["cluster.routing.allocation.disk.watermark.low"],
            "90%"
        );
        // spec.config wins over the baseline
        assert_eq!(parsed["network.host"], "127.0.0.1");
        assert_eq!(
            parsed["plugins.security.ssl.transport.enforce_hostname_verification"],
            false
        );
    }

    #[test]
    fn test_config_yaml_adds_s3_clients() {
        let yaml = opensearch_config_yaml(&sample(), &repositories()).unwrap();
        let parsed: BTreeMap<String, serde_json::Value> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed["s3.client.backup.endpoint"],
            "s3.us-east-1.amazonaws.com"
        );
        assert_eq!(parsed["s3.client.backup.protocol"], "https");
        assert_eq!(parsed["s3.client.backup.region"], "us-east-1");
    }

    #[test]
    fn test_keystore_setup_script() {
        let script = keystore_setup_script(&repositories());
        assert!(script.contains(
            "echo \"$OPENSEARCH_S3_BACKUP_ACCESS_KEY_ID\" | ./bin/opensearch-keystore add --stdin --force s3.client.backup.access_key"
        ));
        assert!(script.contains("s3.client.backup.secret_key"));
        assert!(keystore_setup_script(&[]).is_empty());
    }

    #[test]
    fn test_container_env_references_credential_secrets() {
        let env = container_env(&repositories());
        let entries = env.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1]["name"], "OPENSEARCH_S3_BACKUP_ACCESS_KEY_ID");
        assert_eq!(
            entries[1]["valueFrom"]["secretKeyRef"]["name"],
            "s3-credentials"
        );
        assert_eq!(
            entries[2]["valueFrom"]["secretKeyRef"]["key"],
            "secret-access-key"
        );
    }

    #[test]
    fn test_statefulset_vars() {
        let cluster = sample();
        let vars = statefulset_vars(&cluster, &[], "#!/bin/bash\nexec foo\n").unwrap();
        assert_eq!(vars["replicas"], "3");
        assert_eq!(vars["disk_size"], "5Gi");
        assert_eq!(vars["image"], "opensearchproject/opensearch:3.1.0");
        assert_eq!(vars["node_selector"], "{}");
        assert_eq!(vars["tolerations"], "[]");
        assert_eq!(vars["creation_timestamp_epoch"], "1714564800");
        // JSON-quoted for embedding into the container command
        assert_eq!(vars["startup_script"], "\"#!/bin/bash\\nexec foo\\n\"");
    }

    #[test]
    fn test_startup_script_vars_compute_heap() {
        let vars = startup_script_vars(&sample(), &[]).unwrap();
        assert_eq!(vars["jvm_heap_mb"], "2048");
        assert_eq!(vars["plugin_version"], "3.1.0.0");
        assert!(vars["keystore_setup"].is_empty());
    }

    #[test]
    fn test_dashboards_vars_track_version() {
        let vars = dashboards_vars(&sample()).unwrap();
        assert_eq!(
            vars["dashboards_image"],
            "opensearchproject/opensearch-dashboards:3.1.0"
        );
    }
}
