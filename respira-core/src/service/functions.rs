//! HTTP client for the hosted serverless functions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    CustomExercise, CustomExerciseRequest, GuidanceRequest, GuidanceService, RetryPolicy,
    SpeechRequest, SpeechSynthesizer, StressAnalysis, StressAnalysisRequest, with_retry,
};
use crate::audio::AudioClip;
use crate::config::ServiceConfig;
use crate::error::ServiceError;

/// Client for `{functions_url}/generate-speech`, `/generate-breathing-guidance`,
/// `/generate-custom-exercise` and `/analyze-stress`.
#[derive(Debug, Clone)]
pub struct FunctionsClient {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
    timeout_secs: u64,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GuidanceResponse {
    #[serde(rename = "guidanceText")]
    guidance_text: Option<String>,
}

impl FunctionsClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
            timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }

    /// Build a client from the `service` config section.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::Connection {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.functions_url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            access_token: config.access_token.clone(),
            timeout_secs: config.request_timeout_secs,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                ..RetryPolicy::default()
            },
        })
    }

    /// Authenticate requests as a signed-in user.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, function: &str) -> String {
        format!("{}/{}", self.base_url, function)
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    /// Map a non-success status and body to a `ServiceError`.
    ///
    /// Function errors arrive as `{"error": "..."}`; anything else is passed
    /// through verbatim.
    pub(crate) fn map_http_error(status: reqwest::StatusCode, body: &str) -> ServiceError {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                if body.is_empty() {
                    status.canonical_reason().unwrap_or("unknown error").to_string()
                } else {
                    body.to_string()
                }
            });
        match status.as_u16() {
            401 | 403 => ServiceError::AuthFailed { message },
            code @ 400..=499 => ServiceError::Rejected {
                status: code,
                message,
            },
            code => ServiceError::Unavailable {
                status: code,
                message,
            },
        }
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            ServiceError::Connection {
                message: err.to_string(),
            }
        }
    }

    async fn post(&self, function: &str, body: &Value) -> Result<reqwest::Response, ServiceError> {
        let url = self.endpoint(function);
        debug!(url = %url, "Calling service function");
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body));
        }
        Ok(response)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        body: &Value,
    ) -> Result<T, ServiceError> {
        let response = self.post(function, body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text)
            && let Some(Value::String(error)) = map.get("error")
        {
            return Err(ServiceError::MalformedResponse {
                message: error.clone(),
            });
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::MalformedResponse {
            message: format!("{function}: {e}"),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for FunctionsClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioClip, ServiceError> {
        let body = serde_json::json!({
            "text": request.text,
            "voice": request.voice.id(),
            "speed": request.speed,
        });
        let bytes = with_retry(&self.retry, || async {
            let response = self.post("generate-speech", &body).await?;
            response
                .bytes()
                .await
                .map_err(|e| self.map_transport_error(e))
        })
        .await?;

        if bytes.is_empty() {
            return Err(ServiceError::EmptyAudio);
        }
        debug!(bytes = bytes.len(), voice = %request.voice, "Synthesized speech");
        Ok(AudioClip::mpeg(request.text.clone(), bytes))
    }

    fn name(&self) -> &str {
        "functions"
    }
}

#[async_trait]
impl GuidanceService for FunctionsClient {
    async fn generate_guidance_text(
        &self,
        request: &GuidanceRequest,
    ) -> Result<String, ServiceError> {
        let body = serde_json::to_value(request).map_err(|e| ServiceError::MalformedResponse {
            message: e.to_string(),
        })?;
        let response: GuidanceResponse = with_retry(&self.retry, || {
            self.post_json("generate-breathing-guidance", &body)
        })
        .await?;
        response
            .guidance_text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ServiceError::MalformedResponse {
                message: "guidance response has no guidanceText".to_string(),
            })
    }

    async fn generate_custom_exercise(
        &self,
        request: &CustomExerciseRequest,
    ) -> Result<CustomExercise, ServiceError> {
        let body = serde_json::to_value(request).map_err(|e| ServiceError::MalformedResponse {
            message: e.to_string(),
        })?;
        with_retry(&self.retry, || {
            self.post_json("generate-custom-exercise", &body)
        })
        .await
    }

    async fn analyze_stress(
        &self,
        request: &StressAnalysisRequest,
    ) -> Result<StressAnalysis, ServiceError> {
        if request.stress_entries.is_empty() {
            return Err(ServiceError::Rejected {
                status: 400,
                message: "No stress entries provided".to_string(),
            });
        }
        let body = serde_json::to_value(request).map_err(|e| ServiceError::MalformedResponse {
            message: e.to_string(),
        })?;
        let analysis: StressAnalysis =
            with_retry(&self.retry, || self.post_json("analyze-stress", &body)).await?;
        if analysis.analysis.trim().is_empty() {
            return Err(ServiceError::MalformedResponse {
                message: "analysis response is empty".to_string(),
            });
        }
        Ok(analysis)
    }
}
