// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Provider adapters for AI backends.
//!
//! Each backend is reached through [`ModelProvider`], which hides transport and
//! authentication and returns raw response text. Turning that text into a
//! typed analysis is the coordinator's job (see `parse`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::ContextMode;

/// Narrow contract every AI backend adapter implements.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send one analysis query and return the provider's free-form answer.
    async fn generate(
        &self,
        query: &str,
        ward: &str,
        context: ContextMode,
    ) -> Result<String, ProviderError>;

    /// Lightweight availability check.
    async fn probe(&self) -> Result<(), ProviderError>;
}

const SYSTEM_PROMPT: &str = "You are a political strategy analyst. Respond with a single JSON object \
with the fields strategic_summary (string), key_findings (array of strings), opportunities \
(array of strings), threats (array of strings), recommended_actions (array of objects with \
action and rationale) and confidence (number between 0 and 1). Do not include any other text.";

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// OpenAI-compatible chat-completions adapter.
#[derive(Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpProvider {
    /// Build an adapter. The client timeout is only a transport backstop; the
    /// coordinator applies the per-depth timeouts.
    pub fn try_new(config: &ProviderConfig, transport_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(transport_timeout)
            .build()
            .map_err(|e| ProviderError::Unknown(format!("failed to build http client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            client,
        })
    }

    fn classify(status: StatusCode, body: String) -> ProviderError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(body),
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(body),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
            other => ProviderError::Unknown(format!("unexpected status {other}: {body}")),
        }
    }

    fn transport_error(error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unknown(error.to_string())
        }
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn generate(
        &self,
        query: &str,
        ward: &str,
        context: ContextMode,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Ward: {ward}\nPosture: {context}\n\n{query}"),
                },
            ],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        let completion = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(Self::transport_error)?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        tracing::debug!(model = %self.name, bytes = content.len(), "provider responded");
        Ok(content)
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, body))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_failure_kinds() {
        assert!(matches!(
            HttpProvider::classify(StatusCode::UNAUTHORIZED, String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            HttpProvider::classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::RateLimited(_)
        ));
        assert_eq!(
            HttpProvider::classify(StatusCode::GATEWAY_TIMEOUT, String::new()),
            ProviderError::Timeout
        );
        assert!(matches!(
            HttpProvider::classify(StatusCode::INTERNAL_SERVER_ERROR, "oops".into()),
            ProviderError::Unknown(_)
        ));
    }
}
