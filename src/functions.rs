//! Serverless functions client: translate, detect-language, task assistant.
//!
//! DESIGN
//! ======
//! Each function is a JSON POST to `{base_url}/functions/v1/{name}`,
//! authorized with the project's anon key. The functions themselves are thin
//! proxies to upstream AI services; this client only speaks their wire shape:
//!
//! - `translate`:       `{text, target}` -> `{translated}`
//! - `detect-language`: `{text}` -> `{language}`
//! - `task-assistant`:  `{message, taskContext, language}` -> `{response}`
//!
//! ERROR HANDLING
//! ==============
//! Translate/detect errors are returned to the caller (the translation cache
//! decides how to degrade). The assistant never fails: any upstream problem
//! yields a canned reply in the requested language, matching the function's
//! own always-200 contract so the UI keeps working.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::env_parse;
use crate::error::ErrorCode;
use crate::translation::Translator;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("missing config: env var {var} not set")]
    MissingConfig { var: String },

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    #[error("function request failed: {0}")]
    Request(String),

    #[error("function returned status {status}")]
    Response { status: u16, body: String },

    #[error("function response parse failed: {0}")]
    Parse(String),
}

impl ErrorCode for FunctionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingConfig { .. } => "E_MISSING_CONFIG",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Request(_) => "E_FUNCTION_REQUEST",
            Self::Response { .. } => "E_FUNCTION_RESPONSE",
            Self::Parse(_) => "E_FUNCTION_PARSE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Response { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionsConfig {
    pub base_url: String,
    pub anon_key: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl FunctionsConfig {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            anon_key: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Build from environment variables.
    ///
    /// Required:
    /// - `TIGER_FUNCTIONS_URL`: project base URL
    ///
    /// Optional:
    /// - `TIGER_ANON_KEY`: sent as bearer token and `apikey` header
    /// - `TIGER_FUNCTIONS_TIMEOUT_SECS`: default 30
    /// - `TIGER_FUNCTIONS_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns [`FunctionError::MissingConfig`] when the base URL is unset.
    pub fn from_env() -> Result<Self, FunctionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FunctionError> {
        let base_url = lookup("TIGER_FUNCTIONS_URL")
            .ok_or_else(|| FunctionError::MissingConfig { var: "TIGER_FUNCTIONS_URL".into() })?;
        let mut config = Self::new(&base_url);
        config.anon_key = lookup("TIGER_ANON_KEY").filter(|k| !k.is_empty());
        config.request_timeout =
            Duration::from_secs(env_parse(&lookup, "TIGER_FUNCTIONS_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS));
        config.connect_timeout = Duration::from_secs(env_parse(
            &lookup,
            "TIGER_FUNCTIONS_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));
        Ok(config)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translated: String,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    language: String,
}

/// Question for the task assistant.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantRequest {
    pub message: String,
    /// Free-form description of the task being discussed.
    #[serde(rename = "taskContext", skip_serializing_if = "Option::is_none")]
    pub task_context: Option<serde_json::Value>,
    pub language: String,
}

#[derive(Deserialize)]
struct AssistantResponse {
    response: String,
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct FunctionsClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: Option<String>,
}

impl FunctionsClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: FunctionsConfig) -> Result<Self, FunctionError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FunctionError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.base_url, anon_key: config.anon_key })
    }

    /// # Errors
    ///
    /// Returns an error on transport failure, non-200 status, or a malformed body.
    pub async fn translate_text(&self, text: &str, target: &str) -> Result<String, FunctionError> {
        let resp: TranslateResponse = self
            .invoke("translate", &TranslateRequest { text, target })
            .await?;
        Ok(resp.translated)
    }

    /// # Errors
    ///
    /// Returns an error on transport failure, non-200 status, or a malformed body.
    pub async fn detect(&self, text: &str) -> Result<String, FunctionError> {
        let resp: DetectResponse = self.invoke("detect-language", &DetectRequest { text }).await?;
        Ok(resp.language)
    }

    /// Ask the task assistant. Falls back to a canned reply on any failure.
    pub async fn ask_assistant(&self, request: &AssistantRequest) -> String {
        match self
            .invoke::<_, AssistantResponse>("task-assistant", request)
            .await
        {
            Ok(resp) if !resp.response.trim().is_empty() => resp.response,
            Ok(_) => {
                warn!(language = %request.language, "assistant returned empty reply; using fallback");
                fallback_reply(&request.language).to_owned()
            }
            Err(e) => {
                warn!(error = %e, language = %request.language, "assistant unavailable; using fallback");
                fallback_reply(&request.language).to_owned()
            }
        }
    }

    async fn invoke<Req, Resp>(&self, name: &str, body: &Req) -> Result<Resp, FunctionError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/functions/v1/{}", self.base_url, name);
        debug!(%url, "functions: invoke");
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.anon_key {
            request = request.bearer_auth(key).header("apikey", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FunctionError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| FunctionError::Request(e.to_string()))?;
        if status != 200 {
            return Err(FunctionError::Response { status, body: text });
        }
        serde_json::from_str(&text).map_err(|e| FunctionError::Parse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Translator for FunctionsClient {
    async fn detect_language(&self, text: &str) -> Result<String, FunctionError> {
        self.detect(text).await
    }

    async fn translate(&self, text: &str, target: &str) -> Result<String, FunctionError> {
        self.translate_text(text, target).await
    }
}

/// Canned assistant reply for when the upstream model is unreachable.
#[must_use]
pub fn fallback_reply(language: &str) -> &'static str {
    match language.split(['-', '_']).next().unwrap_or(language) {
        "es" => "Lo siento, el asistente no está disponible en este momento. Inténtalo de nuevo más tarde.",
        "pt" => "Desculpe, o assistente não está disponível no momento. Tente novamente mais tarde.",
        "fr" => "Désolé, l'assistant n'est pas disponible pour le moment. Veuillez réessayer plus tard.",
        _ => "Sorry, the assistant is unavailable right now. Please try again later.",
    }
}

#[cfg(test)]
#[path = "functions_test.rs"]
mod tests;
