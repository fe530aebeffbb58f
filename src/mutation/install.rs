//! Install init container scaffold
//!
//! Built once per request before any mutator runs. Mutators append env vars
//! and mounts to it; the pipeline adds it to the pod only if at least one
//! mutator acted.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, ResourceRequirements,
    SeccompProfile, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::DynaKube;

/// Name of the install init container
pub const INSTALL_CONTAINER_NAME: &str = "install-oneagent";

/// Failure policy handed to the installer
pub const INJECTION_FAILURE_POLICY_ENV: &str = "FAILURE_POLICY";
/// Pod name via downward API
pub const K8S_POD_NAME_ENV: &str = "K8S_PODNAME";
/// Pod UID via downward API
pub const K8S_POD_UID_ENV: &str = "K8S_PODUID";
/// Pod name without the generated suffix
pub const K8S_BASE_POD_NAME_ENV: &str = "K8S_BASEPODNAME";
/// Cluster identifier
pub const K8S_CLUSTER_ID_ENV: &str = "K8S_CLUSTER_ID";
/// Namespace via downward API
pub const K8S_NAMESPACE_ENV: &str = "K8S_NAMESPACE";
/// Node name via downward API
pub const K8S_NODE_NAME_ENV: &str = "K8S_NODE_NAME";

const DEFAULT_USER: i64 = 1001;
const DEFAULT_GROUP: i64 = 1001;

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// Create the install container with the env every injection mode needs
pub fn create_install_init_container_base(
    webhook_image: &str,
    cluster_id: &str,
    pod: &Pod,
    dynakube: &DynaKube,
) -> Container {
    Container {
        name: INSTALL_CONTAINER_NAME.to_string(),
        image: Some(webhook_image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec!["init".to_string()]),
        env: Some(vec![
            value_env(
                INJECTION_FAILURE_POLICY_ENV,
                dynakube.feature_injection_failure_policy(),
            ),
            field_env(K8S_POD_NAME_ENV, "metadata.name"),
            field_env(K8S_POD_UID_ENV, "metadata.uid"),
            value_env(K8S_BASE_POD_NAME_ENV, base_pod_name(pod)),
            value_env(K8S_CLUSTER_ID_ENV, cluster_id),
            field_env(K8S_NAMESPACE_ENV, "metadata.namespace"),
            field_env(K8S_NODE_NAME_ENV, "spec.nodeName"),
        ]),
        security_context: Some(security_context_for(pod)),
        resources: Some(init_container_resources(dynakube)),
        ..Default::default()
    }
}

/// Pod name up to, not including, the last dash
///
/// Prefers `generateName` since the final name is usually not assigned at
/// admission time.
pub fn base_pod_name(pod: &Pod) -> String {
    let name = pod
        .metadata
        .generate_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(pod.metadata.name.as_deref())
        .unwrap_or_default();

    match name.rfind('-') {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

/// Locked-down security context, running as the application's user
fn security_context_for(pod: &Pod) -> SecurityContext {
    let spec = pod.spec.as_ref();
    let app_ctx = spec
        .and_then(|s| s.containers.first())
        .and_then(|c| c.security_context.as_ref());
    let pod_ctx = spec.and_then(|s| s.security_context.as_ref());

    let run_as_user = app_ctx
        .and_then(|c| c.run_as_user)
        .or_else(|| pod_ctx.and_then(|c| c.run_as_user))
        .unwrap_or(DEFAULT_USER);
    let run_as_group = app_ctx
        .and_then(|c| c.run_as_group)
        .or_else(|| pod_ctx.and_then(|c| c.run_as_group))
        .unwrap_or(DEFAULT_GROUP);

    SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        privileged: Some(false),
        run_as_non_root: Some(run_as_user != 0 && run_as_group != 0),
        run_as_user: Some(run_as_user),
        run_as_group: Some(run_as_group),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

fn init_container_resources(dynakube: &DynaKube) -> ResourceRequirements {
    if let Some(resources) = dynakube.spec.init_resources.clone() {
        return resources;
    }
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities("30m", "30Mi")),
        limits: Some(quantities("100m", "60Mi")),
        ..Default::default()
    }
}

/// Append the install container to the pod's init containers
pub fn add_init_container_to_pod(pod: &mut Pod, install_container: Container) {
    let spec = pod.spec.get_or_insert_with(Default::default);
    spec.init_containers
        .get_or_insert_with(Vec::new)
        .push(install_container);
}

/// The install container added by an earlier pass, if present
pub fn find_install_container(pod: &mut Pod) -> Option<&mut Container> {
    pod.spec
        .as_mut()?
        .init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == INSTALL_CONTAINER_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::test_support::{container, dynakube, env_value, pod};
    use k8s_openapi::api::core::v1::PodSecurityContext;

    #[test]
    fn scaffold_carries_image_and_cluster() {
        let p = pod(vec![container("app", "nginx")]);
        let init = create_install_init_container_base("webhook:1.0", "cluster-uid", &p, &dynakube());

        assert_eq!(init.name, INSTALL_CONTAINER_NAME);
        assert_eq!(init.image.as_deref(), Some("webhook:1.0"));
        assert_eq!(init.args, Some(vec!["init".to_string()]));
        assert_eq!(env_value(&init, K8S_CLUSTER_ID_ENV), Some("cluster-uid"));
        assert_eq!(env_value(&init, K8S_BASE_POD_NAME_ENV), Some("checkout-7d9f8"));
        assert_eq!(env_value(&init, INJECTION_FAILURE_POLICY_ENV), Some("silent"));
    }

    #[test]
    fn base_pod_name_falls_back_to_name() {
        let mut p = pod(vec![]);
        p.metadata.generate_name = None;
        p.metadata.name = Some("standalone".to_string());
        assert_eq!(base_pod_name(&p), "standalone");

        p.metadata.name = Some("web-0".to_string());
        assert_eq!(base_pod_name(&p), "web");
    }

    #[test]
    fn security_context_inherits_pod_user() {
        let mut p = pod(vec![container("app", "nginx")]);
        if let Some(spec) = p.spec.as_mut() {
            spec.security_context = Some(PodSecurityContext {
                run_as_user: Some(2000),
                run_as_group: Some(3000),
                ..Default::default()
            });
        }
        let ctx = security_context_for(&p);
        assert_eq!(ctx.run_as_user, Some(2000));
        assert_eq!(ctx.run_as_group, Some(3000));
        assert_eq!(ctx.run_as_non_root, Some(true));
        assert_eq!(ctx.read_only_root_filesystem, Some(true));
    }

    #[test]
    fn root_user_is_not_marked_non_root() {
        let mut app = container("app", "nginx");
        app.security_context = Some(SecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        });
        let ctx = security_context_for(&pod(vec![app]));
        assert_eq!(ctx.run_as_non_root, Some(false));
    }

    #[test]
    fn install_container_is_found_after_adding() {
        let mut p = pod(vec![container("app", "nginx")]);
        assert!(find_install_container(&mut p).is_none());

        let init = create_install_init_container_base("webhook:1.0", "c", &p, &dynakube());
        add_init_container_to_pod(&mut p, init);
        assert!(find_install_container(&mut p).is_some());
    }
}
