//! # Error Types
//!
//! Operator-wide error type. Reconciliation steps bubble these up to the
//! operator loop, which logs and waits for the next watch event to retrigger.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("OpenSearch API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenSearch API returned {status} for {path}: {body}")]
    OpenSearchApi {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to read template directory {path}: {source}")]
    TemplateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("unknown template {0:?}")]
    UnknownTemplate(String),

    #[error("template {template:?} is missing variables: {variables:?}")]
    MissingTemplateVariables {
        template: String,
        variables: Vec<String>,
    },

    #[error("template {template:?} did not render valid YAML: {source}")]
    InvalidTemplateYaml {
        template: String,
        source: serde_yaml::Error,
    },

    #[error("manifest has no {0} field")]
    IncompleteManifest(&'static str),

    #[error("secret {secret:?} has no {key:?} key")]
    MissingSecretKey { secret: String, key: String },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("image {0:?} has no version tag")]
    MissingImageTag(String),

    #[error("failed to generate RSA key: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("failed to build certificate: {0}")]
    CertificateBuilder(#[from] x509_cert::builder::Error),

    #[error("failed to encode certificate material: {0}")]
    Der(#[from] x509_cert::der::Error),

    #[error("failed to encode public key: {0}")]
    Spki(#[from] x509_cert::spki::Error),

    #[error("failed to encode private key: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("failed to hash password: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}
