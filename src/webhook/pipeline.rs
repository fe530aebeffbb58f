//! Mutator pipeline
//!
//! Drives the registered mutators over one pod. A pod that any mutator
//! recognizes as its own earlier work goes through reinvocation; everything
//! else gets a first injection. The pipeline is synchronous and does no I/O:
//! configuration is resolved before it runs, and the events it produces are
//! returned to the caller for publishing.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error, info};

use crate::annotations;
use crate::config::WebhookConfig;
use crate::events::PodEvent;
use crate::mutation::{install, BaseRequest, MutationRequest, PodMutator, ReinvocationRequest};
use crate::Error;

/// Where a pod ended up after the pipeline ran
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutcome {
    /// First injection; carries the mutated pod
    Mutated(Box<Pod>),
    /// Reinvocation changed an already injected pod
    ReinvocationUpdated(Box<Pod>),
    /// Nothing to do; the pod is admitted as is
    Unchanged,
    /// A mutator failed; the pod is admitted as is with this message
    Failed(String),
}

/// Outcome plus the events to publish once the request is answered
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineResult {
    /// Final state of the pod
    pub outcome: PipelineOutcome,
    /// Events describing what happened
    pub events: Vec<PodEvent>,
}

impl PipelineResult {
    fn unchanged() -> Self {
        Self {
            outcome: PipelineOutcome::Unchanged,
            events: Vec::new(),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            outcome: PipelineOutcome::Failed(message),
            events: Vec::new(),
        }
    }
}

/// Whether any mutator recognizes the pod as already injected
pub fn is_injected(mutators: &[Box<dyn PodMutator>], request: &BaseRequest) -> bool {
    mutators.iter().any(|m| m.injected(request))
}

/// Message for a pod admitted unchanged because a mutator failed
pub fn fail_open_message(pod_name: &str, err: &Error) -> String {
    format!("Failed to inject into pod: {pod_name} because {err}")
}

/// Ordered set of mutators shared by every request
pub struct InjectionPipeline {
    config: Arc<WebhookConfig>,
    mutators: Vec<Box<dyn PodMutator>>,
}

impl InjectionPipeline {
    /// Create a pipeline running `mutators` in the given order
    pub fn new(config: Arc<WebhookConfig>, mutators: Vec<Box<dyn PodMutator>>) -> Self {
        Self { config, mutators }
    }

    /// Registered mutator names, in order
    pub fn mutator_names(&self) -> Vec<&'static str> {
        self.mutators.iter().map(|m| m.name()).collect()
    }

    /// Run the pipeline over an eligible pod
    pub fn run(&self, base: BaseRequest) -> PipelineResult {
        if is_injected(&self.mutators, &base) {
            self.handle_reinvocation(base)
        } else {
            self.handle_mutation(base)
        }
    }

    fn handle_mutation(&self, base: BaseRequest) -> PipelineResult {
        let install_container = install::create_install_init_container_base(
            &self.config.webhook_image,
            &base.context.cluster_id,
            &base.pod,
            &base.dynakube,
        );
        let mut request = MutationRequest::new(base, install_container);

        let mut mutated = false;
        for mutator in &self.mutators {
            if !mutator.enabled(&request.base) {
                debug!(mutator = mutator.name(), pod = %request.base.pod_name(), "Mutator disabled for pod");
                continue;
            }
            if let Err(e) = mutator.mutate(&mut request) {
                error!(
                    mutator = mutator.name(),
                    pod = %request.base.pod_name(),
                    error = %e,
                    "Failed to inject into pod"
                );
                return PipelineResult::failed(fail_open_message(request.base.pod_name(), &e));
            }
            mutated = true;
        }

        if !mutated {
            info!(pod = %request.base.pod_name(), "No mutation is enabled");
            return PipelineResult::unchanged();
        }

        let MutationRequest {
            mut base,
            install_container,
        } = request;
        install::add_init_container_to_pod(&mut base.pod, install_container);
        annotations::set(&mut base.pod.metadata.annotations, annotations::INJECTED, "true");

        info!(
            pod = %base.context.pod_name,
            namespace = %base.context.namespace,
            "Injection finished for pod"
        );
        PipelineResult {
            events: vec![PodEvent::Injected {
                pod: base.context.pod_name.clone(),
                namespace: base.context.namespace.clone(),
            }],
            outcome: PipelineOutcome::Mutated(Box::new(base.pod)),
        }
    }

    fn handle_reinvocation(&self, mut base: BaseRequest) -> PipelineResult {
        if base.dynakube.feature_disable_reinvocation_policy() {
            debug!(pod = %base.pod_name(), "Reinvocation disabled on DynaKube");
            return PipelineResult::unchanged();
        }

        let mut updated = false;
        for mutator in &self.mutators {
            if !mutator.enabled(&base) {
                continue;
            }
            let mut request = ReinvocationRequest { base: &mut base };
            if mutator.reinvoke(&mut request) {
                updated = true;
            }
        }

        if !updated {
            info!(pod = %base.pod_name(), "No change, all containers already injected");
            return PipelineResult::unchanged();
        }

        info!(pod = %base.pod_name(), "Reinvocation policy applied");
        PipelineResult {
            events: vec![PodEvent::Updated {
                pod: base.context.pod_name.clone(),
                namespace: base.context.namespace.clone(),
            }],
            outcome: PipelineOutcome::ReinvocationUpdated(Box::new(base.pod)),
        }
    }
}
