//! Eligibility gate: decides whether a pod is considered for injection at all

use k8s_openapi::api::core::v1::Pod;
use kube::core::{Selector, SelectorExt};

use crate::annotations;
use crate::crd::DynaKube;
use crate::{Error, Result};

/// Message returned when the pod selector does not match
pub const NOT_SELECTED_MESSAGE: &str = "pod was not selected for injection";

/// Outcome of the eligibility check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Run the mutator pipeline
    Proceed,
    /// Allow the pod unchanged, with the reason
    Skip(String),
}

/// Decide whether the pod is eligible for injection
///
/// Rules are checked in order and the first failing one wins:
/// the `dynatrace.com/inject` opt-out, the OpenShift debug-pod markers, then
/// the DynaKube pod selector. A selector that cannot be parsed is an error.
pub fn decide(pod: &Pod, dynakube: &DynaKube) -> Result<Verdict> {
    let pod_annotations = pod.metadata.annotations.as_ref();

    if !annotations::get_field_bool(pod_annotations, annotations::INJECT, true) {
        return Ok(Verdict::Skip("injection disabled by pod annotation".to_string()));
    }

    if is_debug_pod(pod) {
        return Ok(Verdict::Skip("pod is an OpenShift debug pod".to_string()));
    }

    if let Some(selector) = dynakube.spec.pod_selector.clone() {
        let selector = Selector::try_from(selector).map_err(|e| Error::selector(e.to_string()))?;
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        if !selector.matches(&labels) {
            return Ok(Verdict::Skip(NOT_SELECTED_MESSAGE.to_string()));
        }
    }

    Ok(Verdict::Proceed)
}

/// `oc debug` copies of a pod carry both source markers
fn is_debug_pod(pod: &Pod) -> bool {
    pod.metadata.annotations.as_ref().is_some_and(|a| {
        a.contains_key(annotations::OC_DEBUG_SOURCE_CONTAINER)
            && a.contains_key(annotations::OC_DEBUG_SOURCE_RESOURCE)
    })
}
