//! Metadata enrichment
//!
//! Gives every application container a directory where the install
//! container writes workload metadata (kind, name, cluster) for the agents
//! and ingest clients to pick up.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, SecretVolumeSource, Volume, VolumeMount,
};
use tracing::info;

use super::env;
use super::{BaseRequest, MutationRequest, PodMutator, ReinvocationRequest};
use crate::annotations;
use crate::{Error, Result};

/// Volume the install container writes enrichment files into
pub const ENRICHMENT_VOLUME_NAME: &str = "metadata-enrichment";
/// Volume carrying the ingest endpoint secret
pub const ENDPOINT_VOLUME_NAME: &str = "metadata-enrichment-endpoint";
/// Secret rendered by the operator into every monitored namespace
pub const ENDPOINT_SECRET_NAME: &str = "dynatrace-metadata-enrichment-endpoint";

const ENRICHMENT_MOUNT_PATH: &str = "/var/lib/dynatrace/enrichment";
const ENDPOINT_MOUNT_PATH: &str = "/var/lib/dynatrace/enrichment/endpoint";
const INSTALL_ENRICHMENT_MOUNT_PATH: &str = "/mnt/enrichment";

const NAME: &str = "metadata-enrichment";

/// Adds workload metadata files to application containers
#[derive(Clone, Debug, Default)]
pub struct MetadataEnrichmentMutator;

impl MetadataEnrichmentMutator {
    /// Create the mutator
    pub fn new() -> Self {
        Self
    }
}

impl PodMutator for MetadataEnrichmentMutator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enabled(&self, request: &BaseRequest) -> bool {
        let enabled_on_pod = annotations::get_field_bool(
            request.pod.metadata.annotations.as_ref(),
            annotations::METADATA_ENRICHMENT_INJECT,
            request.dynakube.feature_automatic_injection(),
        );
        enabled_on_pod
            && request.dynakube.metadata_enrichment_enabled()
            && request.matches_namespace_selector()
    }

    fn injected(&self, request: &BaseRequest) -> bool {
        annotations::get_field_bool(
            request.pod.metadata.annotations.as_ref(),
            annotations::METADATA_ENRICHMENT_INJECTED,
            false,
        )
    }

    fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let MutationRequest {
            base,
            install_container,
        } = request;

        let workload = base
            .context
            .workload
            .clone()
            .ok_or_else(|| Error::mutation(NAME, "workload owner of the pod was not resolved"))?;
        let pod = &mut base.pod;
        let spec = pod
            .spec
            .as_mut()
            .ok_or_else(|| Error::mutation(NAME, "pod has no spec"))?;

        info!(
            pod = %base.context.pod_name,
            kind = %workload.kind,
            name = %workload.name,
            "Adding metadata enrichment to pod"
        );

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        for volume in [enrichment_volume(), endpoint_volume()] {
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume);
            }
        }

        env::add_workload_info_init_envs(install_container, &workload);
        install_container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount(ENRICHMENT_VOLUME_NAME, INSTALL_ENRICHMENT_MOUNT_PATH));

        for container in spec.containers.iter_mut() {
            add_enrichment_mounts(container);
        }

        set_annotations(pod, &workload);
        Ok(())
    }

    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool {
        if !self.injected(&*request.base) {
            return false;
        }
        let Some(spec) = request.base.pod.spec.as_mut() else {
            return false;
        };

        let mut updated = false;
        for container in spec
            .containers
            .iter_mut()
            .filter(|c| !container_is_enriched(c))
        {
            info!(container = %container.name, "Reinvocation: adding metadata enrichment");
            add_enrichment_mounts(container);
            updated = true;
        }
        updated
    }
}

fn set_annotations(pod: &mut Pod, workload: &env::WorkloadInfo) {
    let a = &mut pod.metadata.annotations;
    annotations::set(a, annotations::METADATA_ENRICHMENT_INJECTED, "true");
    annotations::set(a, annotations::WORKLOAD_KIND, workload.kind.as_str());
    annotations::set(a, annotations::WORKLOAD_NAME, workload.name.as_str());
}

fn container_is_enriched(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == ENRICHMENT_VOLUME_NAME)
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn add_enrichment_mounts(container: &mut Container) {
    if container_is_enriched(container) {
        return;
    }
    container.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount(ENRICHMENT_VOLUME_NAME, ENRICHMENT_MOUNT_PATH),
        mount(ENDPOINT_VOLUME_NAME, ENDPOINT_MOUNT_PATH),
    ]);
}

fn enrichment_volume() -> Volume {
    Volume {
        name: ENRICHMENT_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn endpoint_volume() -> Volume {
    Volume {
        name: ENDPOINT_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(ENDPOINT_SECRET_NAME.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
