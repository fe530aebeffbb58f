//! Code-module injection
//!
//! Mounts the OneAgent code modules into every application container, puts
//! the agent library on the preload list, and tells the install container
//! what to download and for which containers.

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, Namespace, Pod, SecretVolumeSource, Volume,
    VolumeMount,
};
use tracing::info;

use super::env::{self, InstallerInfo};
use super::install;
use super::{BaseRequest, MutationRequest, PodMutator, ReinvocationRequest};
use crate::annotations;
use crate::crd::DynaKube;
use crate::{Error, Result};

/// Install path used when the pod does not override it
pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";

/// Volume holding the code modules
pub const BIN_VOLUME_NAME: &str = "oneagent-bin";
/// Volume shared between install container and applications
pub const SHARE_VOLUME_NAME: &str = "oneagent-share";
/// Volume with the injection configuration secret
pub const INJECTION_CONFIG_VOLUME_NAME: &str = "injection-config";
/// Secret rendered by the operator into every monitored namespace
pub const INJECTION_CONFIG_SECRET_NAME: &str = "dynatrace-dynakube-config";

/// CSI driver providing the code modules
pub const CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

const INSTALL_BIN_MOUNT_PATH: &str = "/mnt/bin";
const INSTALL_SHARE_MOUNT_PATH: &str = "/mnt/share";
const INSTALL_CONFIG_MOUNT_PATH: &str = "/mnt/config";
const LD_SO_PRELOAD_PATH: &str = "/etc/ld.so.preload";
const LD_SO_PRELOAD_SUB_PATH: &str = "ld.so.preload";
const CONTAINER_CONF_PATH: &str = "/var/lib/dynatrace/oneagent/agent/config/container.conf";

const DEFAULT_FLAVOR: &str = "default";
const DEFAULT_TECHNOLOGIES: &str = "all";

const NAME: &str = "oneagent";

/// Injects the OneAgent code modules
#[derive(Clone, Debug, Default)]
pub struct OneAgentMutator;

impl OneAgentMutator {
    /// Create the mutator
    pub fn new() -> Self {
        Self
    }
}

impl PodMutator for OneAgentMutator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enabled(&self, request: &BaseRequest) -> bool {
        let enabled_on_pod = annotations::get_field_bool(
            request.pod.metadata.annotations.as_ref(),
            annotations::ONEAGENT_INJECT,
            request.dynakube.feature_automatic_injection(),
        );
        enabled_on_pod
            && request.dynakube.needs_app_injection()
            && request.matches_namespace_selector()
    }

    fn injected(&self, request: &BaseRequest) -> bool {
        annotations::get_field_bool(
            request.pod.metadata.annotations.as_ref(),
            annotations::ONEAGENT_INJECTED,
            false,
        )
    }

    fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let MutationRequest {
            base,
            install_container,
        } = request;
        let BaseRequest {
            pod,
            namespace,
            dynakube,
            context,
        } = base;

        if !dynakube.is_communication_route_clear() {
            info!(
                pod = %context.pod_name,
                "No communication hosts on DynaKube, skipping code module injection"
            );
            annotations::set(&mut pod.metadata.annotations, annotations::ONEAGENT_INJECTED, "false");
            annotations::set(
                &mut pod.metadata.annotations,
                annotations::ONEAGENT_REASON,
                annotations::REASON_EMPTY_CONNECTION_INFO,
            );
            return Ok(());
        }

        if pod.spec.is_none() {
            return Err(Error::mutation(NAME, "pod has no spec"));
        }

        let installer = installer_info(pod, dynakube);
        add_volumes(pod, dynakube);
        configure_install_container(install_container, &installer, dynakube);

        let containers = pod
            .spec
            .as_mut()
            .map(|s| &mut s.containers)
            .ok_or_else(|| Error::mutation(NAME, "pod has no spec"))?;
        env::set_container_count(install_container, containers.len());

        let target = ContainerTarget {
            install_path: &installer.install_path,
            dynakube,
            namespace,
            cluster_id: &context.cluster_id,
        };
        for (i, container) in containers.iter_mut().enumerate() {
            env::add_container_info_init_env(
                install_container,
                i + 1,
                &container.name,
                container.image.as_deref().unwrap_or_default(),
            );
            target.inject(container);
        }

        annotations::set(&mut pod.metadata.annotations, annotations::ONEAGENT_INJECTED, "true");
        Ok(())
    }

    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool {
        if !self.injected(&*request.base) {
            return false;
        }
        let BaseRequest {
            pod,
            namespace,
            dynakube,
            context,
        } = &mut *request.base;

        let install_path = annotations::get_field(
            pod.metadata.annotations.as_ref(),
            annotations::INSTALL_PATH,
            DEFAULT_INSTALL_PATH,
        )
        .to_string();

        let Some(spec) = pod.spec.as_mut() else {
            return false;
        };
        let new_containers: Vec<usize> = spec
            .containers
            .iter()
            .enumerate()
            .filter(|(_, c)| !container_is_injected(c))
            .map(|(i, _)| i)
            .collect();
        if new_containers.is_empty() {
            return false;
        }

        info!(
            pod = %context.pod_name,
            count = new_containers.len(),
            "Reinvocation: injecting code modules into new containers"
        );

        let total = spec.containers.len();
        let already_injected = total - new_containers.len();
        let mut install_container = spec
            .init_containers
            .as_mut()
            .and_then(|ics| ics.iter_mut().find(|c| c.name == install::INSTALL_CONTAINER_NAME));

        let target = ContainerTarget {
            install_path: &install_path,
            dynakube,
            namespace,
            cluster_id: &context.cluster_id,
        };
        for (offset, index) in new_containers.into_iter().enumerate() {
            let container = &mut spec.containers[index];
            if let Some(init) = install_container.as_deref_mut() {
                env::add_container_info_init_env(
                    init,
                    already_injected + offset + 1,
                    &container.name,
                    container.image.as_deref().unwrap_or_default(),
                );
            }
            target.inject(container);
        }
        if let Some(init) = install_container {
            env::set_container_count(init, total);
        }
        true
    }
}

/// Everything needed to inject one application container
struct ContainerTarget<'a> {
    install_path: &'a str,
    dynakube: &'a DynaKube,
    namespace: &'a Namespace,
    cluster_id: &'a str,
}

impl ContainerTarget<'_> {
    fn inject(&self, container: &mut Container) {
        info!(container = %container.name, "Adding OneAgent to container");
        add_oneagent_volume_mounts(container, self.install_path);
        env::add_deployment_metadata_env(container, self.dynakube, self.cluster_id);
        env::add_preload_env(container, self.install_path);
        env::add_version_detection_envs(container, &env::version_label_mapping(self.namespace));
        if let Some(zone) = self.dynakube.network_zone() {
            env::add_network_zone_env(container, zone);
        }
    }
}

/// Installer settings from pod annotations, with DynaKube defaults
fn installer_info(pod: &Pod, dynakube: &DynaKube) -> InstallerInfo {
    let a = pod.metadata.annotations.as_ref();
    InstallerInfo {
        flavor: annotations::get_field(a, annotations::FLAVOR, DEFAULT_FLAVOR).to_string(),
        technologies: annotations::get_field(a, annotations::TECHNOLOGIES, DEFAULT_TECHNOLOGIES)
            .to_string(),
        install_path: annotations::get_field(a, annotations::INSTALL_PATH, DEFAULT_INSTALL_PATH)
            .to_string(),
        installer_url: annotations::get_field(a, annotations::INSTALLER_URL, "").to_string(),
        version: dynakube.code_modules_version().to_string(),
    }
}

/// An application container already carrying the code modules
fn container_is_injected(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == BIN_VOLUME_NAME)
}

fn mount(name: &str, path: &str, sub_path: Option<String>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path,
        ..Default::default()
    }
}

fn add_oneagent_volume_mounts(container: &mut Container, install_path: &str) {
    let container_conf = format!("container_{}.conf", container.name);
    container.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount(SHARE_VOLUME_NAME, LD_SO_PRELOAD_PATH, Some(LD_SO_PRELOAD_SUB_PATH.to_string())),
        mount(BIN_VOLUME_NAME, install_path, None),
        mount(SHARE_VOLUME_NAME, CONTAINER_CONF_PATH, Some(container_conf)),
    ]);
}

fn configure_install_container(init: &mut Container, installer: &InstallerInfo, dynakube: &DynaKube) {
    env::add_installer_init_envs(init, installer, dynakube);
    init.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount(BIN_VOLUME_NAME, INSTALL_BIN_MOUNT_PATH, None),
        mount(SHARE_VOLUME_NAME, INSTALL_SHARE_MOUNT_PATH, None),
        mount(INJECTION_CONFIG_VOLUME_NAME, INSTALL_CONFIG_MOUNT_PATH, None),
    ]);
}

fn bin_volume(dynakube: &DynaKube) -> Volume {
    if dynakube.needs_csi_driver() {
        let dynakube_name = dynakube.metadata.name.clone().unwrap_or_default();
        Volume {
            name: BIN_VOLUME_NAME.to_string(),
            csi: Some(CSIVolumeSource {
                driver: CSI_DRIVER_NAME.to_string(),
                read_only: Some(dynakube.feature_read_only_csi_volume()),
                volume_attributes: Some(
                    [
                        ("mode".to_string(), "app".to_string()),
                        ("dynakube".to_string(), dynakube_name),
                    ]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        empty_dir(BIN_VOLUME_NAME)
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn add_volumes(pod: &mut Pod, dynakube: &DynaKube) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    let wanted = [
        bin_volume(dynakube),
        empty_dir(SHARE_VOLUME_NAME),
        Volume {
            name: INJECTION_CONFIG_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(INJECTION_CONFIG_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    for volume in wanted {
        if !volumes.iter().any(|v| v.name == volume.name) {
            volumes.push(volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::env::{CONTAINERS_COUNT_ENV, NETWORK_ZONE_ENV, PRELOAD_ENV};
    use crate::mutation::test_support::*;
    use crate::crd::OneAgentMode;
    use std::collections::{BTreeMap, BTreeSet};

    fn annotated(mut p: Pod, key: &str, value: &str) -> Pod {
        annotations::set(&mut p.metadata.annotations, key, value);
        p
    }

    fn containers(request: &MutationRequest) -> &Vec<Container> {
        &request.base.pod.spec.as_ref().expect("spec").containers
    }

    // =========================================================================
    // Story: When does code-module injection apply
    // =========================================================================

    #[test]
    fn enabled_by_default_for_app_injection_modes() {
        let m = OneAgentMutator::new();
        let request = base_request(pod(vec![container("app", "nginx")]), dynakube());
        assert!(m.enabled(&request));
    }

    #[test]
    fn disabled_for_host_only_modes() {
        let m = OneAgentMutator::new();
        let mut dk = dynakube();
        dk.spec.one_agent.mode = OneAgentMode::ClassicFullStack;
        assert!(!m.enabled(&base_request(pod(vec![]), dk)));
    }

    #[test]
    fn pod_annotation_can_opt_out() {
        let m = OneAgentMutator::new();
        let p = annotated(pod(vec![]), annotations::ONEAGENT_INJECT, "false");
        assert!(!m.enabled(&base_request(p, dynakube())));
    }

    #[test]
    fn pod_annotation_can_opt_in_without_automatic_injection() {
        let m = OneAgentMutator::new();
        let mut dk = dynakube();
        annotations::set(
            &mut dk.metadata.annotations,
            crate::crd::FEATURE_AUTOMATIC_INJECTION,
            "false",
        );
        assert!(!m.enabled(&base_request(pod(vec![]), dk.clone())));

        let p = annotated(pod(vec![]), annotations::ONEAGENT_INJECT, "true");
        assert!(m.enabled(&base_request(p, dk)));
    }

    // =========================================================================
    // Story: First injection
    // =========================================================================

    #[test]
    fn mutate_injects_every_container() {
        let m = OneAgentMutator::new();
        let mut dk = dynakube();
        dk.spec.network_zone = Some("eu".to_string());
        let mut request = mutation_request(
            pod(vec![container("app", "nginx:1.25"), container("worker", "busybox")]),
            dk,
        );

        m.mutate(&mut request).expect("mutation should succeed");

        for c in containers(&request) {
            assert!(container_is_injected(c), "{} not injected", c.name);
            assert_eq!(
                env_value(c, PRELOAD_ENV),
                Some("/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so")
            );
            assert_eq!(env_value(c, NETWORK_ZONE_ENV), Some("eu"));
            let names: Vec<_> = c.env.iter().flatten().map(|e| &e.name).collect();
            let unique: BTreeSet<_> = names.iter().collect();
            assert_eq!(names.len(), unique.len());
        }

        let init = &request.install_container;
        assert_eq!(env_value(init, "CONTAINER_1_NAME"), Some("app"));
        assert_eq!(env_value(init, "CONTAINER_1_IMAGE"), Some("nginx:1.25"));
        assert_eq!(env_value(init, "CONTAINER_2_NAME"), Some("worker"));
        assert_eq!(env_value(init, CONTAINERS_COUNT_ENV), Some("2"));
        assert!(m.injected(&request.base));
    }

    #[test]
    fn mutate_adds_csi_volume_for_cloud_native() {
        let m = OneAgentMutator::new();
        let mut request = mutation_request(pod(vec![container("app", "nginx")]), dynakube());
        m.mutate(&mut request).expect("mutation should succeed");

        let volumes = request
            .base
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.clone())
            .expect("volumes");
        let bin = volumes
            .iter()
            .find(|v| v.name == BIN_VOLUME_NAME)
            .expect("bin volume");
        assert_eq!(
            bin.csi.as_ref().map(|c| c.driver.as_str()),
            Some(CSI_DRIVER_NAME)
        );
        assert!(volumes.iter().any(|v| v.name == INJECTION_CONFIG_VOLUME_NAME));
    }

    #[test]
    fn mutate_uses_install_path_annotation() {
        let m = OneAgentMutator::new();
        let p = annotated(
            pod(vec![container("app", "nginx")]),
            annotations::INSTALL_PATH,
            "/custom/dt",
        );
        let mut request = mutation_request(p, dynakube());
        m.mutate(&mut request).expect("mutation should succeed");

        let app = &containers(&request)[0];
        assert_eq!(
            env_value(app, PRELOAD_ENV),
            Some("/custom/dt/agent/lib64/liboneagentproc.so")
        );
        assert_eq!(
            env_value(&request.install_container, env::INSTALL_PATH_ENV),
            Some("/custom/dt")
        );
    }

    #[test]
    fn missing_connection_info_marks_pod_instead_of_failing() {
        let m = OneAgentMutator::new();
        let mut dk = dynakube();
        dk.status = None;
        let mut request = mutation_request(pod(vec![container("app", "nginx")]), dk);

        m.mutate(&mut request).expect("no error for empty connection info");

        let a: &BTreeMap<String, String> =
            request.base.pod.metadata.annotations.as_ref().expect("annotations");
        assert_eq!(a.get(annotations::ONEAGENT_INJECTED).map(String::as_str), Some("false"));
        assert_eq!(
            a.get(annotations::ONEAGENT_REASON).map(String::as_str),
            Some(annotations::REASON_EMPTY_CONNECTION_INFO)
        );
        assert!(!container_is_injected(&containers(&request)[0]));
        assert!(!m.injected(&request.base));
    }

    #[test]
    fn mutate_fails_without_pod_spec() {
        let m = OneAgentMutator::new();
        let mut p = pod(vec![]);
        p.spec = None;
        let mut request = mutation_request(p, dynakube());
        assert!(m.mutate(&mut request).is_err());
    }

    // =========================================================================
    // Story: Reinvocation after another webhook added containers
    // =========================================================================

    #[test]
    fn reinvoke_is_noop_when_not_injected() {
        let m = OneAgentMutator::new();
        let mut request = mutation_request(pod(vec![container("app", "nginx")]), dynakube());
        assert!(!m.reinvoke(&mut request.to_reinvocation_request()));
    }

    #[test]
    fn reinvoke_injects_only_new_containers() {
        let m = OneAgentMutator::new();
        let mut request = mutation_request(pod(vec![container("app", "nginx")]), dynakube());
        m.mutate(&mut request).expect("mutation should succeed");
        let init = request.install_container.clone();
        install::add_init_container_to_pod(&mut request.base.pod, init);

        // Nothing new yet
        assert!(!m.reinvoke(&mut request.to_reinvocation_request()));

        // A sidecar injected by another webhook
        if let Some(spec) = request.base.pod.spec.as_mut() {
            spec.containers.push(container("istio-proxy", "istio/proxyv2"));
        }
        assert!(m.reinvoke(&mut request.to_reinvocation_request()));

        let sidecar = &containers(&request)[1];
        assert!(container_is_injected(sidecar));

        let init = install::find_install_container(&mut request.base.pod).expect("install container");
        assert_eq!(env_value(init, "CONTAINER_2_NAME"), Some("istio-proxy"));
        assert_eq!(env_value(init, CONTAINERS_COUNT_ENV), Some("2"));

        // A second reinvocation finds nothing left to do
        assert!(!m.reinvoke(&mut request.to_reinvocation_request()));
    }
}
