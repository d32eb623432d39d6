// Webhook delivery
// Signed JSON POSTs with idempotency keys and bounded retries

//! # Webhook Dispatcher
//!
//! Every delivery carries the same idempotency key on every attempt, so a
//! receiver can drop duplicates caused by retries:
//!
//! | Header | Value |
//! |--------|-------|
//! | `Idempotency-Key` | caller supplied, or `wf_{instance}_{action}_{sha256(body)}` |
//! | `X-Workflow-Idempotency-Key` | same as above |
//! | `X-Workflow-Signature` | hex HMAC-SHA256 of the body, when a secret is set |
//! | `X-Workflow-Delivery-Attempt` | 1 for the first attempt, then 2, 3, ... |
//!
//! A 2xx response succeeds. A 4xx response fails at once. 5xx responses,
//! timeouts and connection errors are retried with exponential backoff until the
//! retry budget runs out.

use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::expression::{ExpressionEvaluator, ExpressionVars};
use crate::config::WebhookConfig;
use crate::models::WebhookParams;
use crate::{Result, WorkflowError};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
pub const HEADER_WORKFLOW_IDEMPOTENCY_KEY: &str = "X-Workflow-Idempotency-Key";
pub const HEADER_SIGNATURE: &str = "X-Workflow-Signature";
pub const HEADER_DELIVERY_ATTEMPT: &str = "X-Workflow-Delivery-Attempt";

/// A fully built delivery
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub idempotency_key: String,
    pub secret: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
}

/// What a successful delivery looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
    pub status: u16,
    pub attempts: u32,
    pub idempotency_key: String,
}

/// Assemble the JSON body of a webhook
///
/// The base fields come first, then the map from `payload_expr`, then the
/// rendered `payload` template. Later sources overwrite earlier keys. A template
/// that does not render to an object is sent under `payload`.
pub fn build_payload(
    evaluator: &ExpressionEvaluator,
    params: &WebhookParams,
    base: Map<String, Value>,
    vars: &ExpressionVars,
) -> Result<Value> {
    let mut body = base;

    if let Some(expression) = params.payload_expr.as_deref().filter(|e| !e.trim().is_empty()) {
        body.extend(evaluator.evaluate_map(expression, vars)?);
    }

    if let Some(template) = &params.payload {
        match evaluator.render_value(template, vars)? {
            Value::Object(rendered) => body.extend(rendered),
            Value::Null => {}
            other => {
                body.insert("payload".to_string(), other);
            }
        }
    }

    Ok(Value::Object(body))
}

/// `wf_{instance}_{action}_{hex sha256(body)}`
pub fn default_idempotency_key(instance_id: &str, action_key: &str, body: &[u8]) -> String {
    format!("wf_{}_{}_{}", instance_id, action_key, hex::encode(Sha256::digest(body)))
}

/// Hex encoded HMAC-SHA256 of the body
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| WorkflowError::Internal(format!("invalid webhook secret: {}", err)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sends webhook requests
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Build a request from action params and an already rendered body
    pub fn prepare(
        &self,
        params: &WebhookParams,
        instance_id: &str,
        action_key: &str,
        body: &Value,
    ) -> Result<WebhookRequest> {
        let method_name = params.method.as_deref().unwrap_or("POST").trim().to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| WorkflowError::WebhookFailed(format!("unsupported HTTP method {}", method_name)))?;
        url::Url::parse(&params.url)
            .map_err(|err| WorkflowError::WebhookFailed(format!("invalid webhook url {}: {}", params.url, err)))?;

        let body = serde_json::to_vec(body)?;
        let idempotency_key = params
            .idempotency_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| default_idempotency_key(instance_id, action_key, &body));

        Ok(WebhookRequest {
            url: params.url.clone(),
            method,
            headers: params.headers.clone(),
            body,
            idempotency_key,
            secret: params.secret.clone().filter(|s| !s.is_empty()),
            timeout: Duration::from_millis(params.timeout_ms.unwrap_or(self.config.timeout_ms)),
            retries: params.retries.unwrap_or(self.config.max_retries),
        })
    }

    /// Delay before retry number `attempt` (0 based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = self.config.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.config.max_backoff_ms))
    }

    /// Deliver with retries
    pub async fn send(&self, request: &WebhookRequest) -> Result<WebhookDelivery> {
        let signature = match &request.secret {
            Some(secret) => Some(sign_payload(secret, &request.body)?),
            None => None,
        };

        let mut last_error = String::new();
        for attempt in 0..=request.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }

            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .timeout(request.timeout)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .header(HEADER_IDEMPOTENCY_KEY, &request.idempotency_key)
                .header(HEADER_WORKFLOW_IDEMPOTENCY_KEY, &request.idempotency_key)
                .header(HEADER_DELIVERY_ATTEMPT, (attempt + 1).to_string());
            if let Some(signature) = &signature {
                builder = builder.header(HEADER_SIGNATURE, signature);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            match builder.body(request.body.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(url = %request.url, status = status.as_u16(), attempt = attempt + 1, "webhook delivered");
                        return Ok(WebhookDelivery {
                            status: status.as_u16(),
                            attempts: attempt + 1,
                            idempotency_key: request.idempotency_key.clone(),
                        });
                    }
                    if !status.is_server_error() {
                        return Err(WorkflowError::WebhookFailed(format!(
                            "{} responded {}",
                            request.url, status
                        )));
                    }
                    last_error = format!("{} responded {}", request.url, status);
                }
                Err(err) => {
                    last_error = format!("{}: {}", request.url, err);
                }
            }

            warn!(
                url = %request.url,
                attempt = attempt + 1,
                error = %last_error,
                "webhook attempt failed"
            );
        }

        Err(WorkflowError::WebhookFailed(format!(
            "gave up after {} attempts: {}",
            request.retries + 1,
            last_error
        )))
    }
}
