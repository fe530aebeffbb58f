//! Agent injector - mutating admission webhook for pod instrumentation
//!
//! Intercepts pod creation and injects monitoring agents according to the
//! DynaKube configuring the pod's namespace.
//!
//! # Architecture
//!
//! A request flows through:
//! - configuration resolution (namespace, DynaKube, root workload)
//! - the eligibility gate (opt-out, debug pods, pod selector)
//! - the mutator pipeline (first injection or reinvocation)
//! - the response builder (JSON patch, or an unchanged pod with a message)
//!
//! # Modules
//!
//! - [`annotations`] - Annotation and label keys the webhook reads and writes
//! - [`config`] - Static webhook configuration
//! - [`crd`] - The DynaKube custom resource
//! - [`events`] - Kubernetes Event publishing
//! - [`mutation`] - Pod mutators and environment assembly
//! - [`webhook`] - Admission handler, gate, pipeline and responses
//! - [`error`] - Error types for the webhook

#![deny(missing_docs)]

pub mod annotations;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod mutation;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the webhook HTTPS server
///
/// Port 8443 is used instead of 443 to avoid requiring root privileges.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default directory holding `tls.crt` and `tls.key`
pub const DEFAULT_CERT_DIR: &str = "/tmp/webhook/certs";

/// Component name reported on Kubernetes Events
pub const COMPONENT_NAME: &str = "dynatrace-webhook";
