//! Annotation and label keys shared by the gate, the pipeline and the mutators
//!
//! These names are read by the agent runtime and by other tooling, so they
//! must stay byte-for-byte stable.

use std::collections::BTreeMap;

/// Pod opt-out annotation; injection is on unless this parses as `false`
pub const INJECT: &str = "dynatrace.com/inject";

/// Completion marker written once the pipeline has mutated a pod
pub const INJECTED: &str = "dynakube.dynatrace.com/injected";

/// Per-pod switch for code-module injection
pub const ONEAGENT_INJECT: &str = "oneagent.dynatrace.com/inject";

/// Marker owned by the code-module mutator
pub const ONEAGENT_INJECTED: &str = "oneagent.dynatrace.com/injected";

/// Why code-module injection was skipped on an otherwise mutated pod
pub const ONEAGENT_REASON: &str = "oneagent.dynatrace.com/reason";

/// Installer flavor override
pub const FLAVOR: &str = "oneagent.dynatrace.com/flavor";

/// Installer technologies override
pub const TECHNOLOGIES: &str = "oneagent.dynatrace.com/technologies";

/// Install path override
pub const INSTALL_PATH: &str = "oneagent.dynatrace.com/install-path";

/// Installer URL override
pub const INSTALLER_URL: &str = "oneagent.dynatrace.com/installer-url";

/// Per-pod switch for metadata enrichment
pub const METADATA_ENRICHMENT_INJECT: &str = "metadata-enrichment.dynatrace.com/inject";

/// Marker owned by the metadata enrichment mutator
pub const METADATA_ENRICHMENT_INJECTED: &str = "metadata-enrichment.dynatrace.com/injected";

/// Kind of the pod's root workload, written by metadata enrichment
pub const WORKLOAD_KIND: &str = "metadata.dynatrace.com/k8s.workload.kind";

/// Name of the pod's root workload, written by metadata enrichment
pub const WORKLOAD_NAME: &str = "metadata.dynatrace.com/k8s.workload.name";

/// First of the two annotations `oc debug` puts on debug pods
pub const OC_DEBUG_SOURCE_CONTAINER: &str = "debug.openshift.io/source-container";

/// Second of the two annotations `oc debug` puts on debug pods
pub const OC_DEBUG_SOURCE_RESOURCE: &str = "debug.openshift.io/source-resource";

/// Namespace label naming the DynaKube responsible for the namespace
pub const DYNAKUBE_INSTANCE_LABEL: &str = "dynakube.internal.dynatrace.com/instance";

/// Reason recorded when the DynaKube has no communication hosts yet
pub const REASON_EMPTY_CONNECTION_INFO: &str = "EmptyConnectionInfo";

/// Read a string annotation, falling back to `default` when absent
pub fn get_field<'a>(
    annotations: Option<&'a BTreeMap<String, String>>,
    key: &str,
    default: &'a str,
) -> &'a str {
    annotations
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or(default)
}

/// Read a boolean annotation, falling back to `default` when absent or unparsable
pub fn get_field_bool(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
    default: bool,
) -> bool {
    annotations
        .and_then(|a| a.get(key))
        .and_then(|v| parse_bool(v))
        .unwrap_or(default)
}

/// Parse the boolean spellings accepted in annotations
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Set an annotation, creating the map if needed
pub fn set(annotations: &mut Option<BTreeMap<String, String>>, key: &str, value: impl Into<String>) {
    annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}
