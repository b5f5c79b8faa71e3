//! # Cluster Reconciliation
//!
//! One [`ClusterReconciler`] per live `OpenSearch` resource. `reconcile`
//! converges the cluster's child resources idempotently: Secrets are created
//! once and read back afterwards, everything else is server-side applied on
//! every run. The health watcher is started on the first reconcile and its
//! one-shot green callback is re-registered on every run, so snapshot
//! configuration converges after each spec change once the cluster settles.

pub mod credentials;
pub mod resources;
pub mod snapshots;

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use kube::ResourceExt;

use crate::crd::{OpenSearch, OpenSearchStatus};
use crate::error::Result;
use crate::health::{touches_status, ClusterState, HealthTarget, HealthWatcher};
use crate::k8s::Applier;
use crate::metrics;
use crate::templates::{json_string, TemplateSet};

use snapshots::{normalize_repositories, SnapshotPlan};

/// State shared by every reconciler: clients, templates and the memoized
/// operator-global metrics password.
pub struct Context {
    pub applier: Applier,
    pub http: reqwest::Client,
    pub templates: TemplateSet,
    pub metrics_password: credentials::SharedMetricsPassword,
    pub operator_namespace: String,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("operator_namespace", &self.operator_namespace)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ClusterReconciler {
    ctx: Arc<Context>,
    manifest: OpenSearch,
    watcher: Option<HealthWatcher>,
}

impl ClusterReconciler {
    pub fn new(ctx: Arc<Context>, manifest: OpenSearch) -> Self {
        Self {
            ctx,
            manifest,
            watcher: None,
        }
    }

    fn namespace(&self) -> String {
        self.manifest.namespace().unwrap_or_else(|| "default".into())
    }

    /// Replaces the cached manifest. Reconciles only when the spec itself
    /// changed; metadata-only updates (labels, annotations, resourceVersion)
    /// are absorbed silently.
    pub async fn update(&mut self, new_manifest: OpenSearch) -> Result<()> {
        let spec_changed = new_manifest.spec != self.manifest.spec;
        self.manifest = new_manifest;
        if spec_changed {
            self.reconcile().await
        } else {
            debug!(cluster = %self.manifest.name_any(), "spec unchanged, skipping reconcile");
            Ok(())
        }
    }

    /// Converges all child resources for the cached manifest. Idempotent:
    /// rerunning with the same manifest only re-applies the SSA-managed
    /// resources, which the apiserver treats as no-ops.
    pub async fn reconcile(&mut self) -> Result<()> {
        let cluster = self.manifest.clone();
        info!(cluster = %cluster.name_any(), namespace = %self.namespace(), "reconciling");
        metrics::increment_reconciliations();

        let passwords = self.ensure_credentials_secret(&cluster).await?;
        self.ensure_certificates_secret(&cluster).await?;
        self.ensure_security_config(&cluster, &passwords).await?;
        self.ensure_service(&cluster).await?;
        self.ensure_statefulset(&cluster).await?;
        self.ensure_dashboards_deployment(&cluster).await?;
        self.ensure_dashboards_service(&cluster).await?;

        let admin_password = passwords["admin"].clone();
        self.initialize_or_trigger_watcher(&cluster, admin_password);
        Ok(())
    }

    /// Stops the health watcher. Child resources are left to Kubernetes
    /// garbage collection via their owner references.
    pub fn finalize(&mut self) {
        info!(cluster = %self.manifest.name_any(), "finalizing");
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }

    /// Created exactly once per cluster; later reconciles read the stored
    /// passwords back instead of regenerating them.
    async fn ensure_credentials_secret(
        &self,
        cluster: &OpenSearch,
    ) -> Result<BTreeMap<&'static str, String>> {
        let namespace = self.namespace();
        let secret_name = cluster.credentials_secret_name();

        if let Some(secret) = self.ctx.applier.get_secret(&namespace, &secret_name).await? {
            debug!(secret = %secret_name, "credentials secret exists");
            return credentials::passwords_from_secret(&secret);
        }

        info!(secret = %secret_name, "creating credentials secret");
        let metrics_password = self
            .ctx
            .metrics_password
            .get(&self.ctx.applier, &self.ctx.operator_namespace)
            .await?;
        let passwords = credentials::generate_passwords(&metrics_password);

        let mut vars = resources::common_vars(cluster)?;
        for (user, password) in &passwords {
            vars.insert(password_var(user), password.clone());
        }
        let manifest = self.ctx.templates.render_manifest("credentials_secret", &vars)?;
        self.ctx.applier.apply(&namespace, manifest).await?;
        Ok(passwords)
    }

    /// Created exactly once per cluster; certificate material is never
    /// rotated.
    async fn ensure_certificates_secret(&self, cluster: &OpenSearch) -> Result<()> {
        let namespace = self.namespace();
        let secret_name = cluster.certificates_secret_name();

        if self.ctx.applier.secret_exists(&namespace, &secret_name).await? {
            debug!(secret = %secret_name, "certificates secret exists");
            return Ok(());
        }

        info!(secret = %secret_name, "generating transport PKI");
        let pki = crate::certs::generate_pki()?;

        let mut vars = resources::common_vars(cluster)?;
        vars.insert("ca_cert", json_string(&pki.ca_cert));
        vars.insert("ca_key", json_string(&pki.ca_key));
        vars.insert("node_cert", json_string(&pki.node_cert));
        vars.insert("node_key", json_string(&pki.node_key));
        vars.insert("admin_cert", json_string(&pki.admin_cert));
        vars.insert("admin_key", json_string(&pki.admin_key));
        let manifest = self
            .ctx
            .templates
            .render_manifest("certificates_secret", &vars)?;
        self.ctx.applier.apply(&namespace, manifest).await?;
        Ok(())
    }

    /// Applied on every reconcile; cheap, and SSA makes it idempotent.
    async fn ensure_security_config(
        &self,
        cluster: &OpenSearch,
        passwords: &BTreeMap<&'static str, String>,
    ) -> Result<()> {
        let hashes = credentials::password_hashes(passwords)?;
        let hash_vars: BTreeMap<&str, String> = hashes
            .iter()
            .map(|(key, hash)| (*key, json_string(hash)))
            .collect();

        let internal_users = self.ctx.templates.render_text("_internal_users", &hash_vars)?;
        let roles = self.ctx.templates.render_text("_roles", &BTreeMap::new())?;

        let mut vars = resources::common_vars(cluster)?;
        vars.insert("internal_users", json_string(&internal_users));
        vars.insert("roles", json_string(&roles));
        let manifest = self.ctx.templates.render_manifest("security_configmap", &vars)?;
        self.ctx.applier.apply(&self.namespace(), manifest).await
    }

    async fn ensure_service(&self, cluster: &OpenSearch) -> Result<()> {
        let vars = resources::common_vars(cluster)?;
        let manifest = self.ctx.templates.render_manifest("service", &vars)?;
        self.ctx.applier.apply(&self.namespace(), manifest).await
    }

    async fn ensure_statefulset(&self, cluster: &OpenSearch) -> Result<()> {
        let repositories = normalize_repositories(&cluster.spec.snapshot_repositories);

        let script_vars = resources::startup_script_vars(cluster, &repositories)?;
        let startup_script = self.ctx.templates.render_text("_startup_script", &script_vars)?;

        let vars = resources::statefulset_vars(cluster, &repositories, &startup_script)?;
        let manifest = self.ctx.templates.render_manifest("statefulset", &vars)?;
        self.ctx.applier.apply(&self.namespace(), manifest).await
    }

    async fn ensure_dashboards_deployment(&self, cluster: &OpenSearch) -> Result<()> {
        let vars = resources::dashboards_vars(cluster)?;
        let manifest = self
            .ctx
            .templates
            .render_manifest("dashboards_deployment", &vars)?;
        self.ctx.applier.apply(&self.namespace(), manifest).await
    }

    async fn ensure_dashboards_service(&self, cluster: &OpenSearch) -> Result<()> {
        let vars = resources::common_vars(cluster)?;
        let manifest = self
            .ctx
            .templates
            .render_manifest("dashboards_service", &vars)?;
        self.ctx.applier.apply(&self.namespace(), manifest).await
    }

    /// Starts the health watcher on first reconcile; on every reconcile
    /// (re-)registers the one-shot green callback so snapshot repositories
    /// and policies converge once the cluster is healthy again.
    fn initialize_or_trigger_watcher(&mut self, cluster: &OpenSearch, admin_password: String) {
        let plan = SnapshotPlan {
            base_url: cluster.rest_url(),
            admin_password: admin_password.clone(),
            repositories: normalize_repositories(&cluster.spec.snapshot_repositories),
        };

        match &self.watcher {
            Some(watcher) => watcher.register_on_green(plan),
            None => {
                let target = HealthTarget {
                    namespace: self.namespace(),
                    name: cluster.name_any(),
                    base_url: cluster.rest_url(),
                    admin_password,
                };
                let watcher = HealthWatcher::start(
                    target,
                    self.ctx.applier.clone(),
                    self.ctx.http.clone(),
                );
                watcher.register_on_green(plan);
                self.watcher = Some(watcher);
            }
        }
    }
}

fn password_var(user: &str) -> &'static str {
    match user {
        "admin" => "admin_password",
        "kibanaserver" => "kibanaserver_password",
        "kibanaro" => "kibanaro_password",
        "logstash" => "logstash_password",
        "readall" => "readall_password",
        "snapshotrestore" => "snapshotrestore_password",
        "metrics" => "metrics_password",
        other => unreachable!("unknown internal user {other}"),
    }
}

/// Status writeback, invoked from the health watcher's state-change
/// callback. Only changes to status-relevant keys produce a patch; failures
/// are logged and swallowed, status is a derived view of the cluster, not
/// ground truth.
pub async fn update_status(
    applier: &Applier,
    namespace: &str,
    name: &str,
    state: &ClusterState,
    changed: &[&str],
) {
    if !touches_status(changed) {
        return;
    }

    let status = OpenSearchStatus {
        health: state.status.as_deref().map(capitalize),
        nodes: Some(state.number_of_nodes),
        version: state.version.clone(),
    };

    match applier.patch_status(namespace, name, &status).await {
        Ok(()) => {
            metrics::increment_status_updates();
            debug!(cluster = %name, health = ?status.health, "status updated");
        }
        Err(err) => warn!(cluster = %name, error = %err, "status update failed"),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
