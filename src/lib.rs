//! # OpenSearch Operator
//!
//! A Kubernetes operator that reconciles `OpenSearch` custom resources into
//! managed OpenSearch clusters:
//!
//! 1. **Watches** the `opensearch.reclaim-the-stack.com/v1alpha1` API with
//!    resumable resource-version streaming
//! 2. **Derives child resources** - credentials and certificate Secrets, the
//!    security ConfigMap, the cluster StatefulSet and Service, and an
//!    OpenSearch Dashboards Deployment - all server-side applied with owner
//!    references for cascading deletion
//! 3. **Polls cluster health** per managed cluster and writes it back to the
//!    status subresource
//! 4. **Reconciles snapshot repositories** and snapshot-management policies
//!    against the OpenSearch REST API once the cluster reports green

pub mod certs;
pub mod crd;
pub mod error;
pub mod health;
pub mod k8s;
pub mod metrics;
pub mod operator;
pub mod quantity;
pub mod reconciler;
pub mod server;
pub mod templates;
