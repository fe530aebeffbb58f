//! Mutating admission webhook for pod injection
//!
//! `POST /inject` receives pod-creation AdmissionReviews. Each request is
//! resolved against its DynaKube, checked by the eligibility gate, run
//! through the mutator pipeline and answered with a JSON patch. Failures
//! admit the pod unchanged with a message; only a malformed pod selector
//! denies admission.

pub mod gate;
pub mod pipeline;
pub mod resolve;
pub mod response;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::events::{spawn_pod_events, EventPublisher};
use crate::mutation::{BaseRequest, RequestContext};
use crate::{Error, Result};

use gate::Verdict;
use pipeline::InjectionPipeline;
use resolve::ConfigResolver;
use response::PatchResponse;

/// Message for pods in namespaces no DynaKube monitors
pub const NOT_REQUIRED_MESSAGE: &str = "injection into pod not required";

/// TLS certificate file inside the certificate directory
pub const TLS_CERT_FILE: &str = "tls.crt";
/// TLS key file inside the certificate directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Static configuration
    pub config: Arc<WebhookConfig>,
    /// Mutators, shared by all requests
    pub pipeline: Arc<InjectionPipeline>,
    /// Per-request configuration lookup
    pub resolver: Arc<dyn ConfigResolver>,
    /// Event sink
    pub publisher: Arc<dyn EventPublisher>,
}

impl WebhookState {
    /// Create the webhook state
    pub fn new(
        config: Arc<WebhookConfig>,
        pipeline: Arc<InjectionPipeline>,
        resolver: Arc<dyn ConfigResolver>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            pipeline,
            resolver,
            publisher,
        }
    }
}

/// Create the webhook router
///
/// - POST /inject - Mutate pods on creation
/// - GET /livez - Liveness probe
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/inject", post(inject_handler))
        .route("/livez", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the router over HTTPS until the server fails
pub async fn start_server(
    addr: SocketAddr,
    cert_dir: &Path,
    state: Arc<WebhookState>,
) -> Result<()> {
    let tls_config =
        RustlsConfig::from_pem_file(cert_dir.join(TLS_CERT_FILE), cert_dir.join(TLS_KEY_FILE))
            .await
            .map_err(|e| Error::config(format!("TLS config error: {e}")))?;

    info!(addr = %addr, mutators = ?state.pipeline.mutator_names(), "Starting injection webhook");

    axum_server::bind_rustls(addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal(format!("server error: {e}")))
}

/// Handle a pod-creation admission review
pub async fn inject_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = admit_pod(&state, &req).await;
    Json(response.into_review())
}

/// Answer a single admission request
async fn admit_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = &request.uid;

    let Some(object) = &request.object else {
        debug!(uid = %uid, "No object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let pod = match decode_pod(object) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Admitted object is not a pod");
            return unable_to_inject(&e).into_admission_response(request);
        }
    };
    let namespace = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();
    let pod_name = resolve::pod_display_name(&pod.metadata);

    let resolved = match resolve_config(state, &namespace, &pod).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            return PatchResponse::with_message(NOT_REQUIRED_MESSAGE)
                .into_admission_response(request);
        }
        Err(e) => {
            error!(uid = %uid, namespace = %namespace, error = %e, "Building mutation request failed");
            return unable_to_inject(&e).into_admission_response(request);
        }
    };

    match gate::decide(&pod, &resolved.dynakube) {
        Ok(Verdict::Proceed) => {}
        Ok(Verdict::Skip(reason)) => {
            debug!(uid = %uid, pod = %pod_name, reason = %reason, "Pod skipped");
            return PatchResponse::with_message(reason).into_admission_response(request);
        }
        Err(e) if e.blocks_admission() => {
            error!(uid = %uid, pod = %pod_name, error = %e, "Denying pod");
            return response::deny(request, &e);
        }
        Err(e) => return unable_to_inject(&e).into_admission_response(request),
    }

    let original = match serde_json::to_value(&pod) {
        Ok(v) => v,
        Err(e) => return unable_to_inject(&Error::from(e)).into_admission_response(request),
    };
    let dynakube = resolved.dynakube.clone();
    let base = BaseRequest {
        pod,
        namespace: resolved.namespace,
        dynakube: resolved.dynakube,
        context: RequestContext {
            pod_name: pod_name.clone(),
            namespace,
            cluster_id: state.config.cluster_id.clone(),
            workload: resolved.workload,
        },
    };

    let result = state.pipeline.run(base);
    let patch_response = response::from_outcome(&original, &result.outcome, &pod_name);
    let events = patch_response.reportable_events(result.events);

    info!(
        uid = %uid,
        pod = %pod_name,
        patched = patch_response.patch.is_some(),
        "Admission request handled"
    );
    let admission = patch_response.into_admission_response(request);
    spawn_pod_events(state.publisher.clone(), &dynakube, events);
    admission
}

async fn resolve_config(
    state: &WebhookState,
    namespace: &str,
    pod: &Pod,
) -> Result<Option<resolve::ResolvedConfig>> {
    let lookup = state.resolver.resolve(namespace, pod);
    match tokio::time::timeout(state.config.resolve_timeout, lookup).await {
        Ok(resolved) => resolved,
        Err(_) => Err(Error::resolution(
            namespace,
            format!("timed out after {:?}", state.config.resolve_timeout),
        )),
    }
}

fn decode_pod(object: &DynamicObject) -> Result<Pod> {
    let value: Value = serde_json::to_value(object)?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("admitted object is not a pod: {e}")))
}

fn unable_to_inject(err: &Error) -> PatchResponse {
    PatchResponse::with_message(format!("unable to inject into pod (err={err})"))
}
