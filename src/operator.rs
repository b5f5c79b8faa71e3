//! # Operator Loop
//!
//! Top-level list + watch on `OpenSearch` resources across all namespaces.
//! The registry of live reconcilers is keyed by `metadata.uid`, the identity
//! that survives renames and resource-version churn. The registry is owned
//! exclusively by this task; health watchers run on their own tasks with
//! clones of what they need, so no locking is required here.

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::crd::OpenSearch;
use crate::error::Result;
use crate::k8s::watch::{spawn_watch, ClusterEvent};
use crate::metrics;
use crate::reconciler::{ClusterReconciler, Context};

#[derive(Debug)]
pub struct Operator {
    ctx: Arc<Context>,
    registry: HashMap<String, ClusterReconciler>,
}

impl Operator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            registry: HashMap::new(),
        }
    }

    /// Lists all clusters, reconciles each, then watches from the list's
    /// resource version. Runs until the watch channel closes (it does not,
    /// short of process exit).
    pub async fn run(mut self) -> Result<()> {
        let api: Api<OpenSearch> = Api::all(self.ctx.applier.client().clone());

        let clusters = api.list(&ListParams::default()).await?;
        let resource_version = clusters.metadata.resource_version.clone().unwrap_or_default();
        info!(
            count = clusters.items.len(),
            resource_version = %resource_version,
            "initial cluster list"
        );
        for cluster in clusters {
            self.cluster_applied(cluster).await;
        }

        let mut events = spawn_watch(api, resource_version);
        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::Applied(cluster) => self.cluster_applied(cluster).await,
                ClusterEvent::Deleted(cluster) => self.cluster_deleted(&cluster),
            }
        }
        Ok(())
    }

    async fn cluster_applied(&mut self, cluster: OpenSearch) {
        let Some(uid) = cluster.uid() else {
            warn!(cluster = %cluster.name_any(), "ignoring cluster without uid");
            return;
        };

        let result = match self.registry.get_mut(&uid) {
            Some(reconciler) => reconciler.update(cluster).await,
            None => {
                let mut reconciler = ClusterReconciler::new(Arc::clone(&self.ctx), cluster);
                let result = reconciler.reconcile().await;
                self.registry.insert(uid, reconciler);
                result
            }
        };

        if let Err(err) = result {
            metrics::increment_reconciliation_errors();
            error!(error = %err, "reconciliation failed, awaiting next event");
        }
        metrics::set_managed_clusters(self.registry.len() as i64);
    }

    fn cluster_deleted(&mut self, cluster: &OpenSearch) {
        let Some(uid) = cluster.uid() else {
            return;
        };
        match self.registry.remove(&uid) {
            Some(mut reconciler) => reconciler.finalize(),
            // Deletes for unknown uids are possible after a restart that
            // raced the delete; nothing to tear down.
            None => debug!(cluster = %cluster.name_any(), uid = %uid, "delete for unknown cluster"),
        }
        metrics::set_managed_clusters(self.registry.len() as i64);
    }
}
