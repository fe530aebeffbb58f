//! Environment variable assembly for injected containers
//!
//! Every function here is pure and safe to run twice: it looks up its target
//! variable by exact name first and either leaves it alone, merges into it,
//! or appends a new entry. Names stay unique within a container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector};

use crate::crd::DynaKube;

/// Dynamic loader preload list
pub const PRELOAD_ENV: &str = "LD_PRELOAD";
/// Network zone the agent reports into
pub const NETWORK_ZONE_ENV: &str = "DT_NETWORK_ZONE";
/// Serialized deployment metadata read by the agent on start
pub const DEPLOYMENT_METADATA_ENV: &str = "DT_DEPLOYMENT_METADATA";

/// Release version detected from pod labels
pub const RELEASE_VERSION_ENV: &str = "DT_RELEASE_VERSION";
/// Release product detected from pod labels
pub const RELEASE_PRODUCT_ENV: &str = "DT_RELEASE_PRODUCT";
/// Release stage, only when mapped by namespace annotation
pub const RELEASE_STAGE_ENV: &str = "DT_RELEASE_STAGE";
/// Release build version, only when mapped by namespace annotation
pub const RELEASE_BUILD_VERSION_ENV: &str = "DT_RELEASE_BUILD_VERSION";

/// Installer flavor
pub const INSTALLER_FLAVOR_ENV: &str = "FLAVOR";
/// Installer technologies
pub const INSTALLER_TECH_ENV: &str = "TECHNOLOGIES";
/// Directory the code modules are installed into
pub const INSTALL_PATH_ENV: &str = "INSTALLPATH";
/// Explicit installer download URL
pub const INSTALLER_URL_ENV: &str = "INSTALLER_URL";
/// Code module version to install
pub const INSTALLER_VERSION_ENV: &str = "VERSION";
/// `provisioned` (CSI) or `installer` (download)
pub const INSTALL_MODE_ENV: &str = "MODE";
/// Whether the CSI volume is mounted read-only
pub const READ_ONLY_CSI_ENV: &str = "RO_CSI";
/// Tells the install container that code modules are wanted
pub const ONEAGENT_INJECTED_ENV: &str = "ONEAGENT_INJECTED";
/// Number of application containers described on the install container
pub const CONTAINERS_COUNT_ENV: &str = "CONTAINERS_COUNT";

/// Root workload kind, for metadata enrichment
pub const WORKLOAD_KIND_ENV: &str = "DT_WORKLOAD_KIND";
/// Root workload name, for metadata enrichment
pub const WORKLOAD_NAME_ENV: &str = "DT_WORKLOAD_NAME";
/// Tells the install container to write enrichment files
pub const DATA_INGEST_INJECTED_ENV: &str = "DATA_INGEST_INJECTED";

/// Install mode when the CSI driver provides the code modules
pub const PROVISIONED_VOLUME_MODE: &str = "provisioned";
/// Install mode when the install container downloads the code modules
pub const INSTALLER_VOLUME_MODE: &str = "installer";

/// Preloaded library, relative to the install path
pub const LIB_AGENT_PROC_PATH: &str = "agent/lib64/liboneagentproc.so";

const NAMESPACE_MAPPING_PREFIX: &str = "mapping.release.dynatrace.com/";

/// Env var name → pod field path used for release version detection
pub type VersionLabelMapping = BTreeMap<String, String>;

/// What the install container needs to know to fetch the code modules
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallerInfo {
    /// Installer flavor (`default`, `musl`, ...)
    pub flavor: String,
    /// Comma separated technologies, `all` by default
    pub technologies: String,
    /// Where the code modules end up inside application containers
    pub install_path: String,
    /// Download URL override, empty when unset
    pub installer_url: String,
    /// Code module version, empty for latest
    pub version: String,
}

/// Root workload of a pod, as used by metadata enrichment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadInfo {
    /// Lowercased kind, e.g. `deployment`
    pub kind: String,
    /// Object name
    pub name: String,
}

/// Find an env var by exact name
pub fn find_env<'a>(env: &'a mut [EnvVar], name: &str) -> Option<&'a mut EnvVar> {
    env.iter_mut().find(|e| e.name == name)
}

/// Whether an env var with this exact name exists
pub fn contains_env(env: &[EnvVar], name: &str) -> bool {
    env.iter().any(|e| e.name == name)
}

fn plain(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_ref(name: &str, field_path: &str) -> EnvVar {
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

/// Append `var` unless the container already has a variable with its name
fn append_if_absent(container: &mut Container, var: EnvVar) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    if contains_env(env, &var.name) {
        return false;
    }
    env.push(var);
    true
}

/// Absolute path of the preloaded agent library under `install_path`
pub fn preload_path(install_path: &str) -> String {
    format!("{}/{}", install_path.trim_end_matches('/'), LIB_AGENT_PROC_PATH)
}

/// Add the agent library from `install_path` to the preload list
pub fn add_preload_env(container: &mut Container, install_path: &str) {
    add_preload_path(container, &preload_path(install_path));
}

/// Add an absolute library path to the preload list, merging with an existing one
pub fn add_preload_path(container: &mut Container, path: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match find_env(env, PRELOAD_ENV) {
        Some(existing) => {
            let current = existing.value.as_deref().unwrap_or_default();
            if preload_list_contains(current, path) {
                return;
            }
            existing.value = Some(concat_preload_paths(current, path));
        }
        None => env.push(plain(PRELOAD_ENV, path)),
    }
}

/// Whether `path` is already one of the entries of a preload list
///
/// Entries are separated by colons or whitespace; a path that is merely a
/// prefix of another entry does not count.
pub fn preload_list_contains(list: &str, path: &str) -> bool {
    list.split(|c: char| c == ':' || c.is_whitespace())
        .any(|entry| entry == path)
}

/// Append a path using the delimiter the list already uses
pub fn concat_preload_paths(original: &str, additional: &str) -> String {
    if original.is_empty() {
        return additional.to_string();
    }
    if original.contains(' ') {
        format!("{original} {additional}")
    } else {
        format!("{original}:{additional}")
    }
}

/// Set the network zone the agent reports into
pub fn add_network_zone_env(container: &mut Container, network_zone: &str) {
    append_if_absent(container, plain(NETWORK_ZONE_ENV, network_zone));
}

/// Default release version detection, optionally extended by namespace annotations
///
/// A namespace annotation `mapping.release.dynatrace.com/<key>` maps the
/// corresponding release variable to the given pod field path.
pub fn version_label_mapping(namespace: &Namespace) -> VersionLabelMapping {
    let mut mapping = VersionLabelMapping::from([
        (
            RELEASE_VERSION_ENV.to_string(),
            "metadata.labels['app.kubernetes.io/version']".to_string(),
        ),
        (
            RELEASE_PRODUCT_ENV.to_string(),
            "metadata.labels['app.kubernetes.io/part-of']".to_string(),
        ),
    ]);

    let Some(annotations) = namespace.metadata.annotations.as_ref() else {
        return mapping;
    };
    for (key, field_path) in annotations {
        let Some(suffix) = key.strip_prefix(NAMESPACE_MAPPING_PREFIX) else {
            continue;
        };
        let env_name = match suffix {
            "version" => RELEASE_VERSION_ENV,
            "product" => RELEASE_PRODUCT_ENV,
            "stage" => RELEASE_STAGE_ENV,
            "build-version" => RELEASE_BUILD_VERSION_ENV,
            _ => continue,
        };
        mapping.insert(env_name.to_string(), field_path.clone());
    }
    mapping
}

/// Expose release labels through the downward API, keeping user-defined values
pub fn add_version_detection_envs(container: &mut Container, mapping: &VersionLabelMapping) {
    for (env_name, field_path) in mapping {
        append_if_absent(container, field_ref(env_name, field_path));
    }
}

/// Describe what to install on the (freshly created) install container
pub fn add_installer_init_envs(init: &mut Container, installer: &InstallerInfo, dynakube: &DynaKube) {
    let mode = if dynakube.needs_csi_driver() {
        PROVISIONED_VOLUME_MODE
    } else {
        INSTALLER_VOLUME_MODE
    };
    init.env.get_or_insert_with(Vec::new).extend([
        plain(INSTALLER_FLAVOR_ENV, &installer.flavor),
        plain(INSTALLER_TECH_ENV, &installer.technologies),
        plain(INSTALL_PATH_ENV, &installer.install_path),
        plain(INSTALLER_URL_ENV, &installer.installer_url),
        plain(INSTALLER_VERSION_ENV, &installer.version),
        plain(INSTALL_MODE_ENV, mode),
        plain(
            READ_ONLY_CSI_ENV,
            dynakube.feature_read_only_csi_volume().to_string(),
        ),
        plain(ONEAGENT_INJECTED_ENV, "true"),
    ]);
}

/// Env var carrying the name of the application container at `index`
pub fn container_name_env(index: usize) -> String {
    format!("CONTAINER_{index}_NAME")
}

/// Env var carrying the image of the application container at `index`
pub fn container_image_env(index: usize) -> String {
    format!("CONTAINER_{index}_IMAGE")
}

/// Record name and image of application container `index` (1-based) on the install container
pub fn add_container_info_init_env(init: &mut Container, index: usize, name: &str, image: &str) {
    tracing::debug!(name, image, index, "Adding container info to install container");
    init.env.get_or_insert_with(Vec::new).extend([
        plain(&container_name_env(index), name),
        plain(&container_image_env(index), image),
    ]);
}

/// Set the number of described containers, replacing a previous count
pub fn set_container_count(init: &mut Container, count: usize) {
    let env = init.env.get_or_insert_with(Vec::new);
    match find_env(env, CONTAINERS_COUNT_ENV) {
        Some(existing) => existing.value = Some(count.to_string()),
        None => env.push(plain(CONTAINERS_COUNT_ENV, count.to_string())),
    }
}

/// Deployment metadata string as parsed by the agent
pub fn deployment_metadata(dynakube: &DynaKube, cluster_id: &str) -> String {
    format!(
        "orchestration_tech=Operator-{};script_version={};orchestrator_id={}",
        dynakube.deployment_type(),
        env!("CARGO_PKG_VERSION"),
        cluster_id
    )
}

/// Tell the agent how it was deployed, unless the container already says so
pub fn add_deployment_metadata_env(container: &mut Container, dynakube: &DynaKube, cluster_id: &str) {
    append_if_absent(
        container,
        plain(DEPLOYMENT_METADATA_ENV, deployment_metadata(dynakube, cluster_id)),
    );
}

/// Describe the pod's root workload to the install container
pub fn add_workload_info_init_envs(init: &mut Container, workload: &WorkloadInfo) {
    append_if_absent(init, plain(WORKLOAD_KIND_ENV, &workload.kind));
    append_if_absent(init, plain(WORKLOAD_NAME_ENV, &workload.name));
    append_if_absent(init, plain(DATA_INGEST_INJECTED_ENV, "true"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DynaKubeSpec, OneAgentMode};
    use kube::api::ObjectMeta;
    use std::collections::BTreeSet;

    fn container_with_env(env: Vec<EnvVar>) -> Container {
        Container {
            name: "app".to_string(),
            env: Some(env),
            ..Default::default()
        }
    }

    fn value_of<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect()
    }

    fn assert_unique_names(container: &Container) {
        let names = env_names(container);
        let unique: BTreeSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len(), "duplicate env names: {names:?}");
    }

    fn dynakube(mode: OneAgentMode) -> DynaKube {
        let mut dk = DynaKube::new("dynakube", DynaKubeSpec::default());
        dk.spec.one_agent.mode = mode;
        dk
    }

    // =========================================================================
    // Story: Preload list merging
    // =========================================================================

    #[test]
    fn preload_merges_with_colon_when_list_has_no_spaces() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "/a/b")]);
        add_preload_path(&mut c, "/x/y/agent.so");
        assert_eq!(value_of(&c, PRELOAD_ENV), Some("/a/b:/x/y/agent.so"));
    }

    #[test]
    fn preload_merges_with_space_when_list_uses_spaces() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "/a/b /c/d")]);
        add_preload_path(&mut c, "/x/y/agent.so");
        assert_eq!(value_of(&c, PRELOAD_ENV), Some("/a/b /c/d /x/y/agent.so"));
    }

    #[test]
    fn preload_is_unchanged_when_path_already_listed() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "/a/b:/x/y/agent.so")]);
        add_preload_path(&mut c, "/x/y/agent.so");
        assert_eq!(value_of(&c, PRELOAD_ENV), Some("/a/b:/x/y/agent.so"));
    }

    #[test]
    fn preload_prefix_of_other_entry_is_not_a_match() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "/x/y/agent.so.bak")]);
        add_preload_path(&mut c, "/x/y/agent.so");
        assert_eq!(
            value_of(&c, PRELOAD_ENV),
            Some("/x/y/agent.so.bak:/x/y/agent.so")
        );
    }

    #[test]
    fn preload_is_created_when_missing() {
        let mut c = Container::default();
        add_preload_env(&mut c, "/opt/dynatrace/oneagent-paas");
        assert_eq!(
            value_of(&c, PRELOAD_ENV),
            Some("/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so")
        );
    }

    #[test]
    fn preload_is_idempotent() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "/a/b")]);
        add_preload_env(&mut c, "/opt/dt/");
        add_preload_env(&mut c, "/opt/dt");
        assert_eq!(
            value_of(&c, PRELOAD_ENV),
            Some("/a/b:/opt/dt/agent/lib64/liboneagentproc.so")
        );
        assert_unique_names(&c);
    }

    #[test]
    fn preload_with_empty_existing_value_takes_the_path() {
        let mut c = container_with_env(vec![plain(PRELOAD_ENV, "")]);
        add_preload_path(&mut c, "/x/agent.so");
        assert_eq!(value_of(&c, PRELOAD_ENV), Some("/x/agent.so"));
    }

    // =========================================================================
    // Story: Plain appends
    // =========================================================================

    #[test]
    fn network_zone_is_appended_once() {
        let mut c = Container::default();
        add_network_zone_env(&mut c, "eu-west");
        add_network_zone_env(&mut c, "eu-west");
        assert_eq!(value_of(&c, NETWORK_ZONE_ENV), Some("eu-west"));
        assert_unique_names(&c);
    }

    #[test]
    fn version_detection_keeps_user_defined_values() {
        let mut c = container_with_env(vec![plain(RELEASE_VERSION_ENV, "1.2.3")]);
        let mapping = version_label_mapping(&Namespace::default());
        add_version_detection_envs(&mut c, &mapping);

        assert_eq!(value_of(&c, RELEASE_VERSION_ENV), Some("1.2.3"));
        let product = c
            .env
            .as_ref()
            .and_then(|env| env.iter().find(|e| e.name == RELEASE_PRODUCT_ENV))
            .expect("product env should be added");
        let path = product
            .value_from
            .as_ref()
            .and_then(|v| v.field_ref.as_ref())
            .map(|f| f.field_path.as_str());
        assert_eq!(path, Some("metadata.labels['app.kubernetes.io/part-of']"));
        assert_unique_names(&c);
    }

    #[test]
    fn namespace_annotations_extend_version_mapping() {
        let namespace = Namespace {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([
                    (
                        "mapping.release.dynatrace.com/stage".to_string(),
                        "metadata.labels['stage']".to_string(),
                    ),
                    (
                        "mapping.release.dynatrace.com/version".to_string(),
                        "metadata.annotations['v']".to_string(),
                    ),
                    (
                        "mapping.release.dynatrace.com/unknown".to_string(),
                        "ignored".to_string(),
                    ),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        let mapping = version_label_mapping(&namespace);
        assert_eq!(mapping.len(), 3);
        assert_eq!(
            mapping.get(RELEASE_STAGE_ENV).map(String::as_str),
            Some("metadata.labels['stage']")
        );
        assert_eq!(
            mapping.get(RELEASE_VERSION_ENV).map(String::as_str),
            Some("metadata.annotations['v']")
        );
    }

    #[test]
    fn installer_envs_are_appended_in_order() {
        let mut init = Container::default();
        let installer = InstallerInfo {
            flavor: "default".to_string(),
            technologies: "all".to_string(),
            install_path: "/opt/dynatrace/oneagent-paas".to_string(),
            installer_url: String::new(),
            version: "1.290".to_string(),
        };
        add_installer_init_envs(&mut init, &installer, &dynakube(OneAgentMode::CloudNativeFullStack));

        assert_eq!(
            env_names(&init),
            vec![
                INSTALLER_FLAVOR_ENV,
                INSTALLER_TECH_ENV,
                INSTALL_PATH_ENV,
                INSTALLER_URL_ENV,
                INSTALLER_VERSION_ENV,
                INSTALL_MODE_ENV,
                READ_ONLY_CSI_ENV,
                ONEAGENT_INJECTED_ENV,
            ]
        );
        assert_eq!(value_of(&init, INSTALL_MODE_ENV), Some(PROVISIONED_VOLUME_MODE));
        assert_eq!(value_of(&init, READ_ONLY_CSI_ENV), Some("false"));
        assert_eq!(value_of(&init, ONEAGENT_INJECTED_ENV), Some("true"));
    }

    #[test]
    fn installer_mode_without_csi() {
        let mut init = Container::default();
        add_installer_init_envs(
            &mut init,
            &InstallerInfo::default(),
            &dynakube(OneAgentMode::ApplicationMonitoring),
        );
        assert_eq!(value_of(&init, INSTALL_MODE_ENV), Some(INSTALLER_VOLUME_MODE));
    }

    #[test]
    fn container_info_uses_indexed_names() {
        let mut init = Container::default();
        add_container_info_init_env(&mut init, 1, "app", "nginx:1.25");
        add_container_info_init_env(&mut init, 2, "sidecar", "envoy:1.30");

        assert_eq!(value_of(&init, "CONTAINER_1_NAME"), Some("app"));
        assert_eq!(value_of(&init, "CONTAINER_1_IMAGE"), Some("nginx:1.25"));
        assert_eq!(value_of(&init, "CONTAINER_2_NAME"), Some("sidecar"));
        assert_eq!(value_of(&init, "CONTAINER_2_IMAGE"), Some("envoy:1.30"));
    }

    #[test]
    fn container_count_is_replaced_not_duplicated() {
        let mut init = Container::default();
        set_container_count(&mut init, 1);
        set_container_count(&mut init, 3);
        assert_eq!(value_of(&init, CONTAINERS_COUNT_ENV), Some("3"));
        assert_unique_names(&init);
    }

    #[test]
    fn deployment_metadata_is_skipped_when_present() {
        let dk = dynakube(OneAgentMode::CloudNativeFullStack);
        let mut c = container_with_env(vec![plain(DEPLOYMENT_METADATA_ENV, "custom")]);
        add_deployment_metadata_env(&mut c, &dk, "cluster-uid");
        assert_eq!(value_of(&c, DEPLOYMENT_METADATA_ENV), Some("custom"));

        let mut fresh = Container::default();
        add_deployment_metadata_env(&mut fresh, &dk, "cluster-uid");
        let value = value_of(&fresh, DEPLOYMENT_METADATA_ENV).expect("metadata env");
        assert!(value.starts_with("orchestration_tech=Operator-cloud_native_fullstack;"));
        assert!(value.ends_with(";orchestrator_id=cluster-uid"));
    }

    #[test]
    fn workload_info_is_written_once() {
        let mut init = Container::default();
        let workload = WorkloadInfo {
            kind: "deployment".to_string(),
            name: "checkout".to_string(),
        };
        add_workload_info_init_envs(&mut init, &workload);
        add_workload_info_init_envs(&mut init, &workload);

        assert_eq!(value_of(&init, WORKLOAD_KIND_ENV), Some("deployment"));
        assert_eq!(value_of(&init, WORKLOAD_NAME_ENV), Some("checkout"));
        assert_eq!(value_of(&init, DATA_INGEST_INJECTED_ENV), Some("true"));
        assert_unique_names(&init);
    }
}
