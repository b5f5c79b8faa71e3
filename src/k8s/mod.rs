//! # Kubernetes Client Layer
//!
//! Thin wrapper over [`kube::Client`]: server-side apply of rendered
//! manifests, Secret access and status subresource patches. Client
//! bootstrapping (in-cluster service account, then kubeconfig resolution)
//! and connection pooling are supplied by kube itself.

pub mod watch;

use kube::{
    api::{Api, DynamicObject, Patch, PatchParams, PostParams, ValidationDirective},
    core::{ApiResource, GroupVersionKind},
    Client,
};
use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::crd::{OpenSearch, OpenSearchStatus};
use crate::error::{Error, Result};

/// Field manager identity used for every server-side apply.
pub const FIELD_MANAGER: &str = "opensearch-operator";

/// Pulls the coordinates a server-side apply needs out of a rendered
/// manifest and strips `metadata.managedFields`, which the apiserver
/// rejects in apply requests.
pub fn prepare_apply(mut manifest: serde_json::Value) -> Result<(String, ApiResource, serde_json::Value)> {
    let api_version = manifest["apiVersion"]
        .as_str()
        .ok_or(Error::IncompleteManifest("apiVersion"))?
        .to_string();
    let kind = manifest["kind"]
        .as_str()
        .ok_or(Error::IncompleteManifest("kind"))?
        .to_string();
    let name = manifest["metadata"]["name"]
        .as_str()
        .ok_or(Error::IncompleteManifest("metadata.name"))?
        .to_string();

    if let Some(metadata) = manifest["metadata"].as_object_mut() {
        metadata.remove("managedFields");
    }

    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version.as_str()),
    };
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &kind));

    Ok((name, resource, manifest))
}

#[derive(Clone)]
pub struct Applier {
    client: Client,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier").finish_non_exhaustive()
    }
}

impl Applier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Server-side applies a rendered manifest. Forced, strictly validated
    /// and idempotent: repeated applies of the same manifest are no-ops at
    /// the apiserver level.
    pub async fn apply(&self, namespace: &str, manifest: serde_json::Value) -> Result<()> {
        let (name, resource, manifest) = prepare_apply(manifest)?;
        debug!(kind = %resource.kind, name = %name, namespace = %namespace, "applying manifest");

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.field_validation = Some(ValidationDirective::Strict);

        api.patch(&name, &params, &Patch::Apply(&manifest)).await?;
        Ok(())
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    pub async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.get_secret(namespace, name).await?.is_some())
    }

    /// Creates a Secret, treating an AlreadyExists conflict as success and
    /// returning the object that won the race.
    pub async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or(Error::IncompleteManifest("metadata.name"))?;
        match api.create(&PostParams::default(), &secret).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(name = %name, "secret already exists, reading it back");
                Ok(api.get(&name).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Merge-patches the cluster's status subresource.
    pub async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OpenSearchStatus,
    ) -> Result<()> {
        let api: Api<OpenSearch> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
