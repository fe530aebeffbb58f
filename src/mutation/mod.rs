//! Pod mutators and the per-request state they operate on
//!
//! A mutator encapsulates one category of injection (code modules, metadata
//! enrichment). The pipeline in [`crate::webhook::pipeline`] drives them
//! uniformly through the [`PodMutator`] trait; they never talk to the API
//! server, everything they need is resolved before the pipeline runs.

pub mod env;
pub mod install;
pub mod metadata;
pub mod oneagent;

use k8s_openapi::api::core::v1::{Container, Namespace, Pod};
use kube::core::{Selector, SelectorExt};
use tracing::warn;

use crate::crd::DynaKube;
use crate::Result;

pub use env::WorkloadInfo;
pub use metadata::MetadataEnrichmentMutator;
pub use oneagent::OneAgentMutator;

/// Identifiers describing the admission request, resolved before mutation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Pod name, or its `generateName` when the name is not assigned yet
    pub pod_name: String,
    /// Namespace of the pod
    pub namespace: String,
    /// UID of the `kube-system` namespace, identifying the cluster
    pub cluster_id: String,
    /// Root owner of the pod, if resolution found one
    pub workload: Option<WorkloadInfo>,
}

/// State every mutator can inspect: the pod under edit plus its configuration
#[derive(Clone, Debug)]
pub struct BaseRequest {
    /// The pod being edited; a private copy of the admission payload
    pub pod: Pod,
    /// The namespace the pod is created in
    pub namespace: Namespace,
    /// Workload configuration responsible for the namespace
    pub dynakube: DynaKube,
    /// Request identifiers
    pub context: RequestContext,
}

impl BaseRequest {
    /// Name used in logs and messages
    pub fn pod_name(&self) -> &str {
        &self.context.pod_name
    }

    /// Whether the namespace matches the DynaKube namespace selector
    ///
    /// An absent selector matches every namespace. A selector that cannot be
    /// parsed matches nothing.
    pub fn matches_namespace_selector(&self) -> bool {
        let Some(selector) = self.dynakube.spec.namespace_selector.clone() else {
            return true;
        };
        match Selector::try_from(selector) {
            Ok(selector) => {
                let labels = self.namespace.metadata.labels.clone().unwrap_or_default();
                selector.matches(&labels)
            }
            Err(e) => {
                warn!(error = %e, namespace = %self.context.namespace, "Invalid namespace selector on DynaKube");
                false
            }
        }
    }
}

/// A first-time mutation: the base request plus the install container scaffold
#[derive(Clone, Debug)]
pub struct MutationRequest {
    /// Pod, namespace, configuration and identifiers
    pub base: BaseRequest,
    /// Install init container; mutators append to it, the pipeline adds it to the pod
    pub install_container: Container,
}

impl MutationRequest {
    /// Create a request with the given install container scaffold
    pub fn new(base: BaseRequest, install_container: Container) -> Self {
        Self {
            base,
            install_container,
        }
    }

    /// View this request as a reinvocation of an already injected pod
    pub fn to_reinvocation_request(&mut self) -> ReinvocationRequest<'_> {
        ReinvocationRequest {
            base: &mut self.base,
        }
    }
}

/// A later admission pass over a pod this webhook already mutated
///
/// There is no scaffold: the install container lives in the pod's init
/// containers already.
#[derive(Debug)]
pub struct ReinvocationRequest<'a> {
    /// Pod, namespace, configuration and identifiers
    pub base: &'a mut BaseRequest,
}

/// One category of pod injection
///
/// Implementations are registered once at start-up and shared by every
/// request; they must not keep per-request state.
pub trait PodMutator: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &'static str;

    /// Whether this mutator applies to the pod at all
    fn enabled(&self, request: &BaseRequest) -> bool;

    /// Whether this mutator already mutated the pod in an earlier pass
    fn injected(&self, request: &BaseRequest) -> bool;

    /// Mutate a pod seen for the first time
    fn mutate(&self, request: &mut MutationRequest) -> Result<()>;

    /// Update an already injected pod; returns whether anything changed
    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool;
}

/// The mutators in registration order
pub fn default_mutators() -> Vec<Box<dyn PodMutator>> {
    vec![
        Box::new(OneAgentMutator::new()),
        Box::new(MetadataEnrichmentMutator::new()),
    ]
}
