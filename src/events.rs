//! Kubernetes Events about injected pods
//!
//! Events are attached to the DynaKube responsible for the pod, so
//! `kubectl describe dynakube` shows which pods were injected.
//!
//! Publishing runs on a detached task after the admission response is built.
//! A slow or failing API server only costs a warning in the log.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::crd::DynaKube;

/// Event reasons, as listed under REASON in `kubectl get events`
pub mod reasons {
    /// Pod was injected for the first time
    pub const INJECT: &str = "Inject";
    /// An injected pod was updated on reinvocation
    pub const UPDATE_POD: &str = "UpdatePod";
}

/// Event actions
pub mod actions {
    /// Admission-time pod mutation
    pub const MUTATE: &str = "Mutate";
}

/// Something the pipeline did to a pod, to be reported once the request is answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodEvent {
    /// First injection into the pod
    Injected {
        /// Pod name or generateName
        pod: String,
        /// Pod namespace
        namespace: String,
    },
    /// Reinvocation added injection to new containers
    Updated {
        /// Pod name or generateName
        pod: String,
        /// Pod namespace
        namespace: String,
    },
}

impl PodEvent {
    /// Reason shown under REASON in `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            PodEvent::Injected { .. } => reasons::INJECT,
            PodEvent::Updated { .. } => reasons::UPDATE_POD,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            PodEvent::Injected { pod, namespace } => format!(
                "Injecting the necessary info into pod {pod} in namespace {namespace}"
            ),
            PodEvent::Updated { pod, namespace } => format!(
                "Updating pod {pod} in namespace {namespace} because it has uninjected containers"
            ),
        }
    }

    fn pod(&self) -> &str {
        match self {
            PodEvent::Injected { pod, .. } | PodEvent::Updated { pod, .. } => pod,
        }
    }
}

/// Sink for pod events, recorded on the DynaKube that configured the pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on `regarding`. Failures are logged, never returned.
    async fn publish(&self, regarding: &ObjectReference, event: &PodEvent);
}

/// Records events through the API server
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `component`, optionally naming the webhook pod as instance
    pub fn new(client: Client, component: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: &PodEvent) {
        let record = Event {
            type_: EventType::Normal,
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: actions::MUTATE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&record, regarding).await {
            warn!(
                reason = event.reason(),
                pod = %event.pod(),
                dynakube = ?regarding.name,
                error = %e,
                "Failed to record pod event"
            );
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _event: &PodEvent) {}
}

/// Publish `events` on `dynakube` from a detached task
///
/// Returns `None` when there is nothing to publish. Callers answering an
/// admission request drop the handle.
pub fn spawn_pod_events(
    publisher: Arc<dyn EventPublisher>,
    dynakube: &DynaKube,
    events: Vec<PodEvent>,
) -> Option<JoinHandle<()>> {
    if events.is_empty() {
        return None;
    }
    let regarding = dynakube.object_ref(&());
    Some(tokio::spawn(async move {
        for event in &events {
            publisher.publish(&regarding, event).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::test_support::dynakube;

    fn injected() -> PodEvent {
        PodEvent::Injected {
            pod: "checkout-7d9f8-abcde".to_string(),
            namespace: "shop".to_string(),
        }
    }

    #[test]
    fn reasons_distinguish_injection_from_update() {
        let updated = PodEvent::Updated {
            pod: "p".to_string(),
            namespace: "n".to_string(),
        };
        assert_eq!(injected().reason(), "Inject");
        assert_eq!(updated.reason(), "UpdatePod");
        assert!(injected().note().contains("checkout-7d9f8-abcde"));
        assert!(updated.note().contains("namespace n"));
    }

    #[tokio::test]
    async fn events_are_recorded_on_the_dynakube() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|r, event| {
                r.kind.as_deref() == Some("DynaKube")
                    && r.name.as_deref() == Some("dynakube")
                    && r.namespace.as_deref() == Some("dynatrace")
                    && event.reason() == "Inject"
            })
            .times(1)
            .return_const(());

        let handle = spawn_pod_events(Arc::new(publisher), &dynakube(), vec![injected()])
            .expect("task spawned");
        handle.await.expect("publishing task completes");
    }

    #[tokio::test]
    async fn nothing_to_publish_spawns_nothing() {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(0);
        assert!(spawn_pod_events(Arc::new(publisher), &dynakube(), Vec::new()).is_none());
    }
}
