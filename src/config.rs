//! Static webhook configuration, resolved once at start-up

use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{Api, Client};
use tracing::info;

use crate::{Error, Result};

/// Namespace whose UID identifies the cluster
pub const CLUSTER_ID_NAMESPACE: &str = "kube-system";

/// Default bound on per-request configuration lookups
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration shared by every admission request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Image of the webhook itself, reused for the install container
    pub webhook_image: String,
    /// UID of the `kube-system` namespace
    pub cluster_id: String,
    /// Namespace the webhook and the DynaKubes live in
    pub webhook_namespace: String,
    /// Name of the webhook pod
    pub pod_name: String,
    /// Installed through OLM; namespaces without a DynaKube label are then expected
    pub deployed_via_olm: bool,
    /// Upper bound for resolving a request's configuration
    pub resolve_timeout: Duration,
}

impl WebhookConfig {
    /// Fill in whatever was not configured explicitly from the API server
    ///
    /// The webhook image is read from the webhook's own pod and the cluster
    /// id from the `kube-system` namespace UID.
    pub async fn discover(
        client: Client,
        mut config: WebhookConfig,
    ) -> Result<WebhookConfig> {
        if config.webhook_image.is_empty() {
            config.webhook_image = own_image(&client, &config.webhook_namespace, &config.pod_name).await?;
            info!(image = %config.webhook_image, "Discovered webhook image");
        }
        if config.cluster_id.is_empty() {
            config.cluster_id = cluster_id(&client).await?;
            info!(cluster_id = %config.cluster_id, "Discovered cluster id");
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that every field the pipeline depends on is set
    pub fn validate(&self) -> Result<()> {
        if self.webhook_image.is_empty() {
            return Err(Error::config("webhook image is not set"));
        }
        if self.cluster_id.is_empty() {
            return Err(Error::config("cluster id is not set"));
        }
        if self.webhook_namespace.is_empty() {
            return Err(Error::config("webhook namespace is not set"));
        }
        if self.resolve_timeout.is_zero() {
            return Err(Error::config("resolve timeout must be positive"));
        }
        Ok(())
    }
}

async fn own_image(client: &Client, namespace: &str, pod_name: &str) -> Result<String> {
    if pod_name.is_empty() {
        return Err(Error::config(
            "neither the webhook image nor the webhook pod name is set",
        ));
    }
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get(pod_name).await?;
    pod.spec
        .and_then(|s| s.containers.into_iter().next())
        .and_then(|c| c.image)
        .ok_or_else(|| Error::config(format!("pod {namespace}/{pod_name} has no container image")))
}

async fn cluster_id(client: &Client) -> Result<String> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = namespaces.get(CLUSTER_ID_NAMESPACE).await?;
    ns.metadata
        .uid
        .ok_or_else(|| Error::config(format!("namespace {CLUSTER_ID_NAMESPACE} has no uid")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WebhookConfig {
        WebhookConfig {
            webhook_image: "registry.example.com/dynatrace-operator:1.0".to_string(),
            cluster_id: "cluster-uid".to_string(),
            webhook_namespace: "dynatrace".to_string(),
            pod_name: "dynatrace-webhook-abc".to_string(),
            deployed_via_olm: false,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    #[test]
    fn complete_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn missing_fields_are_config_errors() {
        let mut c = config();
        c.webhook_image.clear();
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = config();
        c.cluster_id.clear();
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = config();
        c.resolve_timeout = Duration::ZERO;
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }
}
