//! Prints the OpenSearch CRD manifest. Run with:
//!
//! ```bash
//! cargo run --bin crdgen > deploy/crd.yaml
//! ```

use kube::CustomResourceExt;

fn main() {
    let crd = opensearch_operator::crd::OpenSearch::crd();
    print!(
        "{}",
        serde_yaml::to_string(&crd).expect("CRD should serialize to YAML")
    );
}
