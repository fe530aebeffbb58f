//! Per-request configuration lookup
//!
//! Resolves the namespace, the DynaKube responsible for it and the pod's
//! root workload before the synchronous pipeline runs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject, ObjectMeta};
use kube::core::GroupVersion;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::annotations::DYNAKUBE_INSTANCE_LABEL;
use crate::crd::DynaKube;
use crate::mutation::WorkloadInfo;
use crate::{Error, Result};

/// Owner chains deeper than this are cut off at the last object reached
pub const MAX_OWNER_DEPTH: usize = 8;

/// Kinds that are followed further up the owner chain
const WELL_KNOWN_WORKLOADS: &[&str] = &[
    "ReplicaSet",
    "Deployment",
    "ReplicationController",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "DeploymentConfig",
];

/// Everything the pipeline needs besides the pod itself
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// Namespace of the pod
    pub namespace: Namespace,
    /// DynaKube selected by the namespace label
    pub dynakube: DynaKube,
    /// Root workload owning the pod
    pub workload: Option<WorkloadInfo>,
}

/// Looks up the configuration for an admitted pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Resolve configuration for `pod` in `namespace`
    ///
    /// `Ok(None)` means the namespace is not monitored and the pod needs no
    /// injection.
    async fn resolve(&self, namespace: &str, pod: &Pod) -> Result<Option<ResolvedConfig>>;
}

/// Resolver backed by the Kubernetes API
pub struct KubeConfigResolver {
    client: Client,
    webhook_namespace: String,
    deployed_via_olm: bool,
}

impl KubeConfigResolver {
    /// Create a resolver reading DynaKubes from `webhook_namespace`
    pub fn new(client: Client, webhook_namespace: impl Into<String>, deployed_via_olm: bool) -> Self {
        Self {
            client,
            webhook_namespace: webhook_namespace.into(),
            deployed_via_olm,
        }
    }

    async fn root_workload(&self, namespace: &str, pod: &Pod) -> Result<WorkloadInfo> {
        let mut current = WorkloadInfo {
            kind: "pod".to_string(),
            name: pod_display_name(&pod.metadata),
        };
        let mut owner = controller_owner(&pod.metadata).cloned();

        for _ in 0..MAX_OWNER_DEPTH {
            let Some(reference) = owner.take() else {
                break;
            };
            if !is_well_known_workload(&reference.kind) {
                break;
            }
            let object = self.get_owner(namespace, &reference).await?;
            current = WorkloadInfo {
                kind: reference.kind.to_lowercase(),
                name: reference.name.clone(),
            };
            owner = controller_owner(&object.metadata).cloned();
        }
        Ok(current)
    }

    async fn get_owner(&self, namespace: &str, reference: &OwnerReference) -> Result<DynamicObject> {
        let gv: GroupVersion = reference.api_version.parse().map_err(|e| {
            Error::resolution(
                namespace,
                format!("invalid owner apiVersion {}: {e}", reference.api_version),
            )
        })?;
        let resource = ApiResource::from_gvk(&gv.with_kind(&reference.kind));
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);
        Ok(api.get(&reference.name).await?)
    }
}

#[async_trait]
impl ConfigResolver for KubeConfigResolver {
    async fn resolve(&self, namespace: &str, pod: &Pod) -> Result<Option<ResolvedConfig>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = namespaces.get(namespace).await?;

        let Some(dynakube_name) = dynakube_name_for(&ns) else {
            if self.deployed_via_olm {
                debug!(namespace, "Namespace has no DynaKube instance label");
                return Ok(None);
            }
            return Err(Error::resolution(
                namespace,
                format!("no DynaKube instance label {DYNAKUBE_INSTANCE_LABEL} on namespace"),
            ));
        };

        let dynakubes: Api<DynaKube> = Api::namespaced(self.client.clone(), &self.webhook_namespace);
        let dynakube = dynakubes.get(&dynakube_name).await?;
        let workload = self.root_workload(namespace, pod).await?;

        debug!(
            namespace,
            dynakube = %dynakube_name,
            kind = %workload.kind,
            name = %workload.name,
            "Resolved injection configuration"
        );
        Ok(Some(ResolvedConfig {
            namespace: ns,
            dynakube,
            workload: Some(workload),
        }))
    }
}

/// Name of the DynaKube the namespace is labelled with
pub fn dynakube_name_for(namespace: &Namespace) -> Option<String> {
    namespace
        .metadata
        .labels
        .as_ref()?
        .get(DYNAKUBE_INSTANCE_LABEL)
        .filter(|n| !n.is_empty())
        .cloned()
}

/// The owner reference marked as controller, if any
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

fn is_well_known_workload(kind: &str) -> bool {
    WELL_KNOWN_WORKLOADS.contains(&kind)
}

/// Pod name, falling back to generateName before the name is assigned
pub fn pod_display_name(meta: &ObjectMeta) -> String {
    meta.name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| meta.generate_name.clone())
        .unwrap_or_default()
}
