//! Activities registered by the default catalog.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Activity, ActivityError, ActivityInput};

// ---------------------------------------------------------------------------
// ValidateDocument
// ---------------------------------------------------------------------------

/// Rejects documents that are not a non-empty JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateDocument;

#[async_trait]
impl Activity for ValidateDocument {
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        match input.document.as_object() {
            Some(fields) if !fields.is_empty() => Ok(json!({ "valid": true, "fields": fields.len() })),
            Some(_) => Err(ActivityError::Failed("document is an empty object".to_string())),
            None => Err(ActivityError::Failed("document is not a JSON object".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// CallPartnerApi
// ---------------------------------------------------------------------------

/// Posts the document to the partner API at `{base_url}/{workflow}`.
///
/// Without a base URL the call is skipped and reported as a dry run.
#[derive(Debug, Clone)]
pub struct CallPartnerApi {
    endpoint: Option<(reqwest::Client, String)>,
}

impl CallPartnerApi {
    /// Creates an activity that calls `base_url` with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: Some((client, base_url.trim_end_matches('/').to_string())),
        })
    }

    /// Creates an activity that never performs network calls.
    #[must_use]
    pub fn dry_run() -> Self {
        Self { endpoint: None }
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.endpoint.is_none()
    }
}

#[async_trait]
impl Activity for CallPartnerApi {
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        let Some((client, base_url)) = &self.endpoint else {
            debug!(
                instance_id = %input.instance_id,
                workflow = %input.workflow,
                "partner API not configured, skipping call"
            );
            return Ok(json!({ "dryRun": true }));
        };

        let url = format!("{base_url}/{}", input.workflow);
        let response = client
            .post(&url)
            .header("x-correlation-id", input.instance_id.as_str())
            .json(input.document.as_ref())
            .send()
            .await
            .map_err(|e| ActivityError::Transient(format!("partner API request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ActivityError::Transient(format!("partner API returned {status}")));
        }
        if !status.is_success() {
            return Err(ActivityError::Failed(format!("partner API returned {status}")));
        }

        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(json!({ "status": status.as_u16(), "response": body }))
    }
}

// ---------------------------------------------------------------------------
// RecordOutcome
// ---------------------------------------------------------------------------

/// Records that an instance reached its final step.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOutcome;

#[async_trait]
impl Activity for RecordOutcome {
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        metrics::counter!(
            "b2b_router_documents_processed_total",
            "workflow" => input.workflow.to_string()
        )
        .increment(1);
        info!(
            instance_id = %input.instance_id,
            workflow = %input.workflow,
            "document processed"
        );
        Ok(json!({ "recorded": true }))
    }
}
