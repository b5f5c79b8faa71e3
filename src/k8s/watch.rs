//! # Resumable Watch
//!
//! Streams OpenSearch watch events into a channel, tracking the resource
//! version across every frame (bookmarks included) so that reconnects resume
//! where the previous stream stopped.
//!
//! A 410 Gone means the tracked version fell out of the apiserver's window;
//! the process exits so supervision restarts it with a fresh list. That is
//! cheaper than re-list-and-diff and safe because reconciliation does not
//! depend on seeing every intermediate event.

use futures::{pin_mut, StreamExt};
use kube::api::{Api, WatchParams};
use kube::core::{ErrorResponse, WatchEvent};
use kube::ResourceExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::crd::OpenSearch;
use crate::metrics;

pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

const GONE: u16 = 410;

/// A watch event the operator loop acts on.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// ADDED or MODIFIED: the manifest as currently stored.
    Applied(OpenSearch),
    Deleted(OpenSearch),
}

/// What to do with one decoded watch frame.
#[derive(Debug)]
pub enum EventDisposition {
    Deliver(ClusterEvent),
    /// Bookmark consumed; only the resource version advanced.
    Skip,
    /// 410 Gone: the caller must abort the process.
    Expired,
    /// Any other ERROR frame: terminate this stream and re-watch.
    Failed(ErrorResponse),
}

/// Folds one watch frame into the tracked resource version. Every frame
/// advances the version when it carries one; skipping bookmarks here would
/// make resumption silently replay or drop events.
pub fn fold_event(
    event: WatchEvent<OpenSearch>,
    resource_version: &mut String,
) -> EventDisposition {
    match event {
        WatchEvent::Added(cluster) | WatchEvent::Modified(cluster) => {
            if let Some(version) = cluster.resource_version() {
                *resource_version = version;
            }
            EventDisposition::Deliver(ClusterEvent::Applied(cluster))
        }
        WatchEvent::Deleted(cluster) => {
            if let Some(version) = cluster.resource_version() {
                *resource_version = version;
            }
            EventDisposition::Deliver(ClusterEvent::Deleted(cluster))
        }
        WatchEvent::Bookmark(bookmark) => {
            *resource_version = bookmark.metadata.resource_version;
            EventDisposition::Skip
        }
        WatchEvent::Error(response) if response.code == GONE => EventDisposition::Expired,
        WatchEvent::Error(response) => EventDisposition::Failed(response),
    }
}

fn exit_expired(resource_version: &str) -> ! {
    error!(
        resource_version,
        "watch expired (410 Gone), exiting for a fresh list on restart"
    );
    std::process::exit(1);
}

/// Spawns the watch task. Events arrive on the returned channel; the task
/// ends when the receiver is dropped.
pub fn spawn_watch(api: Api<OpenSearch>, resource_version: String) -> mpsc::Receiver<ClusterEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run_watch(api, resource_version, tx));
    rx
}

async fn run_watch(api: Api<OpenSearch>, mut resource_version: String, tx: mpsc::Sender<ClusterEvent>) {
    // WatchParams asks for bookmarks by default, which keeps the resource
    // version moving even on quiet clusters.
    let params = WatchParams::default();

    loop {
        info!(resource_version = %resource_version, "starting watch");
        let stream = match api.watch(&params, &resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                if let kube::Error::Api(ref response) = err {
                    if response.code == GONE {
                        exit_expired(&resource_version);
                    }
                }
                warn!(error = %err, "watch request failed, retrying");
                metrics::increment_watch_restarts();
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };
        pin_mut!(stream);

        let mut failed = false;
        loop {
            match stream.next().await {
                Some(Ok(event)) => match fold_event(event, &mut resource_version) {
                    EventDisposition::Deliver(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    EventDisposition::Skip => {}
                    EventDisposition::Expired => exit_expired(&resource_version),
                    EventDisposition::Failed(response) => {
                        warn!(code = response.code, message = %response.message, "watch error event");
                        failed = true;
                        break;
                    }
                },
                Some(Err(err)) => {
                    if let kube::Error::Api(ref response) = err {
                        if response.code == GONE {
                            exit_expired(&resource_version);
                        }
                    }
                    warn!(error = %err, "watch stream error");
                    failed = true;
                    break;
                }
                // Server-side watch timeout; reconnect from the last version.
                None => break,
            }
        }

        if failed {
            metrics::increment_watch_restarts();
            tokio::time::sleep(WATCH_RETRY_DELAY).await;
        }
    }
}
