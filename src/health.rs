//! # Cluster Health Watcher
//!
//! One background task per managed cluster. Polls the OpenSearch REST API,
//! diffs the observed state against the previous poll, writes status back to
//! the custom resource and fires the one-shot "green" snapshot plan.
//!
//! Polling goes over plain HTTP with the generated admin credentials; the
//! PKI from [`crate::certs`] secures the transport layer only.

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::k8s::Applier;
use crate::reconciler::snapshots::{self, SnapshotPlan};
use crate::reconciler::update_status;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Observed cluster state, one snapshot per poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    pub number_of_nodes: i64,
    pub master: Option<String>,
    pub cluster_manager: Option<String>,
    pub status: Option<String>,
    pub version: Option<String>,
}

/// Keys whose change is worth a status subresource patch.
const STATUS_KEYS: [&str; 3] = ["status", "number_of_nodes", "version"];

/// Names of the fields that differ between two observations.
pub fn diff_states(old: &ClusterState, new: &ClusterState) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if old.number_of_nodes != new.number_of_nodes {
        changed.push("number_of_nodes");
    }
    if old.master != new.master {
        changed.push("master");
    }
    if old.cluster_manager != new.cluster_manager {
        changed.push("cluster_manager");
    }
    if old.status != new.status {
        changed.push("status");
    }
    if old.version != new.version {
        changed.push("version");
    }
    changed
}

pub fn touches_status(changed: &[&str]) -> bool {
    changed.iter().any(|key| STATUS_KEYS.contains(key))
}

/// One row of `_cat/nodes?h=name,cluster_manager,master,version&format=json`.
/// Older clusters report the elected node under `master`, newer ones under
/// `cluster_manager`; either column marks it with `*`.
#[derive(Debug, Deserialize)]
struct CatNode {
    name: String,
    #[serde(default)]
    cluster_manager: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    status: String,
}

fn state_from(nodes: &[CatNode], status: &str) -> ClusterState {
    let elected = |pick: fn(&CatNode) -> Option<&str>| {
        nodes
            .iter()
            .find(|node| pick(node) == Some("*"))
            .map(|node| node.name.clone())
    };

    ClusterState {
        number_of_nodes: nodes.len() as i64,
        master: elected(|n| n.master.as_deref()),
        cluster_manager: elected(|n| n.cluster_manager.as_deref()),
        status: Some(status.to_string()),
        version: nodes.iter().find_map(|n| n.version.clone()),
    }
}

/// Connection details for one cluster's REST endpoint.
#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub namespace: String,
    pub name: String,
    pub base_url: String,
    pub admin_password: String,
}

async fn poll(http: &reqwest::Client, target: &HealthTarget) -> crate::error::Result<ClusterState> {
    let nodes: Vec<CatNode> = http
        .get(format!(
            "{}/_cat/nodes?h=name,cluster_manager,master,version&format=json",
            target.base_url
        ))
        .basic_auth("admin", Some(&target.admin_password))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let health: ClusterHealth = http
        .get(format!("{}/_cluster/health", target.base_url))
        .basic_auth("admin", Some(&target.admin_password))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(state_from(&nodes, &health.status))
}

/// Handle to a running health watcher task.
#[derive(Debug)]
pub struct HealthWatcher {
    handle: JoinHandle<()>,
    green_slot: Arc<Mutex<Option<SnapshotPlan>>>,
}

impl HealthWatcher {
    /// Starts the poll loop. `applier` is used for status writeback, `http`
    /// for the OpenSearch REST API.
    pub fn start(target: HealthTarget, applier: Applier, http: reqwest::Client) -> Self {
        let green_slot: Arc<Mutex<Option<SnapshotPlan>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&green_slot);

        let handle = tokio::spawn(async move {
            let mut state = ClusterState::default();
            loop {
                tokio::time::sleep(CHECK_INTERVAL).await;

                let new_state = match poll(&http, &target).await {
                    Ok(new_state) => new_state,
                    Err(err) => {
                        debug!(cluster = %target.name, error = %err, "health poll failed");
                        continue;
                    }
                };

                if new_state.status.as_deref() == Some("green") {
                    // Single-slot one-shot: take clears the registration, so
                    // a later green->yellow->green bounce does not refire.
                    let plan = slot.lock().expect("green slot lock").take();
                    if let Some(plan) = plan {
                        if let Err(err) = snapshots::reconcile_repositories(&http, &plan).await {
                            error!(cluster = %target.name, error = %err, "snapshot reconciliation failed");
                        }
                    }
                }

                let changed = diff_states(&state, &new_state);
                if changed.is_empty() {
                    continue;
                }
                info!(
                    cluster = %target.name,
                    changed = ?changed,
                    status = ?new_state.status,
                    nodes = new_state.number_of_nodes,
                    "cluster state changed"
                );
                update_status(&applier, &target.namespace, &target.name, &new_state, &changed)
                    .await;
                state = new_state;
            }
        });

        Self { handle, green_slot }
    }

    /// Registers (or replaces) the one-shot plan executed on the next green
    /// observation.
    pub fn register_on_green(&self, plan: SnapshotPlan) {
        *self.green_slot.lock().expect("green slot lock") = Some(plan);
    }

    /// Stops the poll loop at its next suspension point.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes_fixture() -> Vec<CatNode> {
        serde_json::from_str(
            r#"[
                {"name": "opensearch-example-0", "cluster_manager": "-", "master": "-", "version": "3.1.0"},
                {"name": "opensearch-example-1", "cluster_manager": "*", "master": "*", "version": "3.1.0"},
                {"name": "opensearch-example-2", "cluster_manager": "-", "master": "-", "version": "3.1.0"}
            ]"#,
        )
        .expect("cat nodes fixture")
    }

    #[test]
    fn test_state_from_cat_nodes() {
        let state = state_from(&nodes_fixture(), "green");
        assert_eq!(state.number_of_nodes, 3);
        assert_eq!(state.master.as_deref(), Some("opensearch-example-1"));
        assert_eq!(
            state.cluster_manager.as_deref(),
            Some("opensearch-example-1")
        );
        assert_eq!(state.status.as_deref(), Some("green"));
        assert_eq!(state.version.as_deref(), Some("3.1.0"));
    }

    #[test]
    fn test_diff_states_reports_changed_keys() {
        let old = state_from(&nodes_fixture(), "yellow");
        let mut new = old.clone();
        new.status = Some("green".into());
        new.number_of_nodes = 4;

        let changed = diff_states(&old, &new);
        assert_eq!(changed, vec!["number_of_nodes", "status"]);
    }

    #[test]
    fn test_diff_states_empty_when_unchanged() {
        let state = state_from(&nodes_fixture(), "green");
        assert!(diff_states(&state, &state.clone()).is_empty());
    }

    #[test]
    fn test_touches_status_gates_on_relevant_keys() {
        assert!(touches_status(&["status"]));
        assert!(touches_status(&["number_of_nodes", "master"]));
        assert!(touches_status(&["version"]));
        assert!(!touches_status(&["master"]));
        assert!(!touches_status(&["cluster_manager", "master"]));
        assert!(!touches_status(&[]));
    }

    #[test]
    fn test_master_absent_when_unelected() {
        let nodes: Vec<CatNode> = serde_json::from_str(
            r#"[{"name": "a", "cluster_manager": "-", "master": "-", "version": "3.1.0"}]"#,
        )
        .unwrap();
        let state = state_from(&nodes, "red");
        assert_eq!(state.master, None);
        assert_eq!(state.cluster_manager, None);
    }
}
