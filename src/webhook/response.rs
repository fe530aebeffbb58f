//! Admission response building
//!
//! Every outcome except a malformed selector is answered with an allowed
//! response: either an RFC 6902 patch from the admitted pod to the mutated
//! one, or no patch plus a message saying why nothing was injected.

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use serde_json::Value;
use tracing::error;

use super::pipeline::PipelineOutcome;
use crate::events::PodEvent;
use crate::Error;

/// An allowed admission response, before it is tied to a request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchResponse {
    /// Patch to apply, `None` for an unchanged pod
    pub patch: Option<Patch>,
    /// Message surfaced to the API server and the user
    pub message: Option<String>,
}

impl PatchResponse {
    /// Admit the pod without changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Admit the pod without changes, explaining why
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            patch: None,
            message: Some(message.into()),
        }
    }

    /// Events worth reporting for this response
    ///
    /// Without a patch nothing reaches the API server, so nothing happened to
    /// the pod and the pipeline's events are dropped.
    pub fn reportable_events(&self, events: Vec<PodEvent>) -> Vec<PodEvent> {
        if self.patch.is_none() {
            return Vec::new();
        }
        events
    }

    /// Bind this response to the request it answers
    pub fn into_admission_response(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        let mut response = AdmissionResponse::from(request);
        if let Some(patch) = self.patch {
            response = match response.with_patch(patch) {
                Ok(patched) => patched,
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                    let mut unchanged = AdmissionResponse::from(request);
                    unchanged.result.message = format!("unable to serialize patch: {e}");
                    return unchanged;
                }
            };
        }
        if let Some(message) = self.message {
            response.result.message = message;
        }
        response
    }
}

/// Diff the admitted pod against its final state
///
/// An identical pod produces no patch. A pod that cannot be serialized fails
/// open with a message naming the pod.
pub fn build_response(original: &Value, final_pod: &Pod, pod_name: &str) -> PatchResponse {
    let final_value = match serde_json::to_value(final_pod) {
        Ok(v) => v,
        Err(e) => {
            let err = Error::from(e);
            error!(pod = %pod_name, error = %err, "Failed to serialize mutated pod");
            return PatchResponse::with_message(super::pipeline::fail_open_message(pod_name, &err));
        }
    };
    let patch = json_patch::diff(original, &final_value);
    if patch.0.is_empty() {
        return PatchResponse::unchanged();
    }
    PatchResponse {
        patch: Some(patch),
        message: None,
    }
}

/// Turn a pipeline outcome into a response for the original payload
pub fn from_outcome(original: &Value, outcome: &PipelineOutcome, pod_name: &str) -> PatchResponse {
    match outcome {
        PipelineOutcome::Mutated(pod) | PipelineOutcome::ReinvocationUpdated(pod) => {
            build_response(original, pod, pod_name)
        }
        PipelineOutcome::Unchanged => PatchResponse::unchanged(),
        PipelineOutcome::Failed(message) => PatchResponse::with_message(message.clone()),
    }
}

/// Reject the pod; only used for configuration errors that must not be skipped
pub fn deny(request: &AdmissionRequest<DynamicObject>, err: &Error) -> AdmissionResponse {
    AdmissionResponse::from(request).deny(err.to_string())
}
