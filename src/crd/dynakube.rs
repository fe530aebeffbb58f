//! DynaKube CRD, reduced to what the injection webhook reads
//!
//! The full resource is owned by the operator; the webhook only consumes the
//! selectors, the injection mode, metadata enrichment and a handful of
//! feature flags carried as annotations on the resource.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::annotations;

/// Feature flag: skip the reinvocation path entirely
pub const FEATURE_DISABLE_REINVOCATION_POLICY: &str =
    "feature.dynatrace.com/disable-webhook-reinvocation-policy";

/// Feature flag: inject into pods that do not opt in explicitly (default true)
pub const FEATURE_AUTOMATIC_INJECTION: &str = "feature.dynatrace.com/automatic-injection";

/// Feature flag: mount the CSI code-module volume read-only
pub const FEATURE_READ_ONLY_CSI_VOLUME: &str = "feature.dynatrace.com/injection-readonly-volume";

/// Feature flag: what the install container does when the agent download fails
pub const FEATURE_INJECTION_FAILURE_POLICY: &str = "feature.dynatrace.com/injection-failure-policy";

const DEFAULT_FAILURE_POLICY: &str = "silent";

/// DynaKube describes which pods receive agent injection and how.
///
/// Example:
/// ```yaml
/// apiVersion: dynatrace.com/v1beta1
/// kind: DynaKube
/// metadata:
///   name: dynakube
///   namespace: dynatrace
/// spec:
///   apiUrl: https://tenant.live.dynatrace.com/api
///   oneAgent:
///     mode: cloudNativeFullStack
///   podSelector:
///     matchLabels:
///       monitored: "true"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    namespaced,
    status = "DynaKubeStatus",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Tenant API URL
    pub api_url: String,

    /// Network zone the injected agents report into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Code-module injection settings
    #[serde(default)]
    pub one_agent: OneAgentSpec,

    /// Restricts injection to pods whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// Restricts injection to namespaces whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Metadata enrichment settings
    #[serde(default)]
    pub metadata_enrichment: MetadataEnrichmentSpec,

    /// Resources for the install init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,
}

/// Code-module injection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Deployment mode
    #[serde(default)]
    pub mode: OneAgentMode,

    /// Provide the code modules through the CSI driver instead of the installer
    #[serde(default)]
    pub use_csi_driver: bool,
}

/// How OneAgent is deployed in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OneAgentMode {
    /// Code modules injected into application pods only
    #[default]
    ApplicationMonitoring,
    /// Host agent plus code modules injected by the webhook
    CloudNativeFullStack,
    /// Host agent injecting into processes itself
    ClassicFullStack,
    /// Host agent without application monitoring
    HostMonitoring,
}

/// Metadata enrichment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnrichmentSpec {
    /// Whether pods get workload metadata files mounted
    #[serde(default)]
    pub enabled: bool,
}

/// DynaKube status as reported by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    /// Version of the code modules currently served
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules_version: Option<String>,

    /// Endpoints the agents can reach; empty until the operator connected
    #[serde(default)]
    pub communication_hosts: Vec<String>,
}

impl DynaKube {
    fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.annotations.as_ref()
    }

    /// Whether application pods should receive code modules
    pub fn needs_app_injection(&self) -> bool {
        matches!(
            self.spec.one_agent.mode,
            OneAgentMode::ApplicationMonitoring | OneAgentMode::CloudNativeFullStack
        )
    }

    /// Whether the code-module volume is provisioned by the CSI driver
    pub fn needs_csi_driver(&self) -> bool {
        match self.spec.one_agent.mode {
            OneAgentMode::CloudNativeFullStack => true,
            OneAgentMode::ApplicationMonitoring => self.spec.one_agent.use_csi_driver,
            _ => false,
        }
    }

    /// Deployment type as reported in the deployment metadata string
    pub fn deployment_type(&self) -> &'static str {
        match self.spec.one_agent.mode {
            OneAgentMode::ApplicationMonitoring => "application_monitoring",
            OneAgentMode::CloudNativeFullStack => "cloud_native_fullstack",
            OneAgentMode::ClassicFullStack => "classic_fullstack",
            OneAgentMode::HostMonitoring => "host_monitoring",
        }
    }

    /// Whether metadata enrichment is switched on
    pub fn metadata_enrichment_enabled(&self) -> bool {
        self.spec.metadata_enrichment.enabled
    }

    /// The configured network zone, if any and non-empty
    pub fn network_zone(&self) -> Option<&str> {
        self.spec
            .network_zone
            .as_deref()
            .filter(|zone| !zone.is_empty())
    }

    /// Version of the code modules, empty when unknown
    pub fn code_modules_version(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.code_modules_version.as_deref())
            .unwrap_or_default()
    }

    /// Whether agents would have anywhere to connect to
    pub fn is_communication_route_clear(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| !s.communication_hosts.is_empty())
    }

    /// Reinvocation handling switched off by feature flag
    pub fn feature_disable_reinvocation_policy(&self) -> bool {
        annotations::get_field_bool(self.annotations(), FEATURE_DISABLE_REINVOCATION_POLICY, false)
    }

    /// Default for the per-pod inject annotations
    pub fn feature_automatic_injection(&self) -> bool {
        annotations::get_field_bool(self.annotations(), FEATURE_AUTOMATIC_INJECTION, true)
    }

    /// Mount the CSI volume read-only
    pub fn feature_read_only_csi_volume(&self) -> bool {
        annotations::get_field_bool(self.annotations(), FEATURE_READ_ONLY_CSI_VOLUME, false)
    }

    /// Failure policy handed to the install container (`silent` or `fail`)
    pub fn feature_injection_failure_policy(&self) -> &str {
        match annotations::get_field(self.annotations(), FEATURE_INJECTION_FAILURE_POLICY, "") {
            "fail" => "fail",
            _ => DEFAULT_FAILURE_POLICY,
        }
    }
}
