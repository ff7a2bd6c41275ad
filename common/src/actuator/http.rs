// HTTP adapter for the automation endpoint
// Delegates page work to the local automation process over JSON. Every
// call is bounded by the client timeout; the runner applies no outer
// timeout of its own.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::actuator::{
    Actuator, BatchActuator, BulkDispatcher, ContextHandle, ContextProvider, EntitlementChecker,
    Resolver,
};
use crate::config::ActuatorConfig;
use crate::errors::ActuationError;
use crate::models::{BatchOutcome, BulkJobRequest, SlotOptions, TaskDescriptor};

/// Production actuator speaking to the local automation endpoint.
pub struct HttpActuator {
    client: Client,
    base: String,
}

#[derive(Serialize)]
struct AcquireRequest<'a> {
    url: &'a str,
    foreground: bool,
}

#[derive(Deserialize)]
struct AcquireResponse {
    id: String,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    task: &'a TaskDescriptor,
    context_id: &'a str,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    source_url: &'a str,
    context_id: &'a str,
}

#[derive(Deserialize)]
struct ResolveResponse {
    urn: Option<String>,
}

#[derive(Deserialize)]
struct FeatureResponse {
    enabled: bool,
}

#[derive(Deserialize)]
struct StatusResponse {
    busy: bool,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    items: &'a [String],
    options: &'a SlotOptions,
}

impl HttpActuator {
    /// Create a new adapter from the actuator configuration.
    pub fn new(config: &ActuatorConfig) -> Result<Self, ActuationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                ActuationError::RequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ActuationError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ActuationError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ActuationError::RequestFailed(format!(
                "{} returned status {}",
                path,
                response.status()
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ActuationError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ContextProvider for HttpActuator {
    #[instrument(skip(self))]
    async fn acquire(&self, url: &str, foreground: bool) -> Result<ContextHandle, ActuationError> {
        let response: AcquireResponse = self
            .post_json("/contexts", &AcquireRequest { url, foreground })
            .await
            .map_err(|e| ActuationError::ContextAcquisitionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        debug!(context_id = %response.id, "Execution context acquired");
        Ok(ContextHandle {
            id: response.id,
            url: url.to_string(),
        })
    }

    #[instrument(skip(self), fields(context_id = %handle.id))]
    async fn release(&self, handle: ContextHandle) {
        // Release is best-effort and idempotent on the endpoint side; a
        // failed release must never break the runner loop.
        let result = self
            .client
            .post(self.url(&format!("/contexts/{}/release", handle.id)))
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to release execution context");
        }
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    #[instrument(skip(self, task), fields(urn = %task.urn, context_id = %context.id))]
    async fn execute(
        &self,
        task: &TaskDescriptor,
        context: &ContextHandle,
    ) -> Result<bool, ActuationError> {
        let response: ExecuteResponse = self
            .post_json(
                "/execute",
                &ExecuteRequest {
                    task,
                    context_id: &context.id,
                },
            )
            .await?;
        Ok(response.success)
    }
}

#[async_trait]
impl Resolver for HttpActuator {
    #[instrument(skip(self), fields(context_id = %context.id))]
    async fn resolve_first_item(
        &self,
        source_url: &str,
        context: &ContextHandle,
    ) -> Result<Option<String>, ActuationError> {
        let response: ResolveResponse = self
            .post_json(
                "/resolve",
                &ResolveRequest {
                    source_url,
                    context_id: &context.id,
                },
            )
            .await?;
        Ok(response.urn)
    }
}

#[async_trait]
impl EntitlementChecker for HttpActuator {
    #[instrument(skip(self))]
    async fn has_feature(&self, name: &str) -> Result<bool, ActuationError> {
        let response = self
            .client
            .get(self.url(&format!("/entitlements/{}", name)))
            .send()
            .await
            .map_err(|e| ActuationError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ActuationError::RequestFailed(format!(
                "entitlement check returned status {}",
                response.status()
            )));
        }

        let feature: FeatureResponse = response
            .json()
            .await
            .map_err(|e| ActuationError::InvalidResponse(e.to_string()))?;
        Ok(feature.enabled)
    }
}

#[async_trait]
impl BulkDispatcher for HttpActuator {
    #[instrument(skip(self, request), fields(keywords = request.keywords.len(), quota = request.quota))]
    async fn dispatch(&self, request: &BulkJobRequest) -> Result<(), ActuationError> {
        let _: serde_json::Value = self.post_json("/bulk", request).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchActuator for HttpActuator {
    async fn is_busy(&self) -> bool {
        // Unreachable endpoint reads as busy: skipping a firing is safer
        // than starting a run nobody can observe.
        match self.client.get(self.url("/status")).send().await {
            Ok(response) => match response.json::<StatusResponse>().await {
                Ok(status) => status.busy,
                Err(e) => {
                    warn!(error = %e, "Malformed status response, treating as busy");
                    true
                }
            },
            Err(e) => {
                warn!(error = %e, "Status check failed, treating as busy");
                true
            }
        }
    }

    #[instrument(skip(self, items, options), fields(items = items.len()))]
    async fn run_batch(
        &self,
        items: &[String],
        options: &SlotOptions,
    ) -> Result<BatchOutcome, ActuationError> {
        self.post_json("/batch", &BatchRequest { items, options })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActuatorConfig;

    fn config() -> ActuatorConfig {
        ActuatorConfig {
            endpoint: "http://127.0.0.1:9321/".to_string(),
            timeout_seconds: 5,
            bulk_feature: "bulk_engagement".to_string(),
        }
    }

    #[test]
    fn test_base_url_strips_trailing_slash() {
        let actuator = HttpActuator::new(&config()).expect("client");
        assert_eq!(actuator.url("/execute"), "http://127.0.0.1:9321/execute");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reads_as_busy() {
        let actuator = HttpActuator::new(&ActuatorConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout_seconds: 1,
            bulk_feature: "bulk_engagement".to_string(),
        })
        .expect("client");
        assert!(actuator.is_busy().await);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_context_acquisition() {
        let actuator = HttpActuator::new(&ActuatorConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout_seconds: 1,
            bulk_feature: "bulk_engagement".to_string(),
        })
        .expect("client");
        let result = actuator.acquire("https://example.com", false).await;
        assert!(matches!(
            result,
            Err(ActuationError::ContextAcquisitionFailed { .. })
        ));
    }
}
