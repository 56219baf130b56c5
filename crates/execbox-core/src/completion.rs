//! Completion proxy for the editor's inline suggestions.
//!
//! Forwards the code and cursor position to an OpenAI-compatible chat
//! completions endpoint. The proxy never fails its caller: any provider
//! problem is logged and answered with an empty suggestion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::CompletionConfig;
use crate::errors::CompletionError;

const CURSOR_MARKER: &str = "<CURSOR>";

const SYSTEM_PROMPT: &str = "You are a code completion engine. Reply with only the text to insert \
at <CURSOR>, without explanations and without markdown fences.";

#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    /// Suggest text to insert at `cursor_offset` (in characters). Empty when there is nothing to offer.
    async fn suggest(&self, code: &str, cursor_offset: usize) -> String;

    fn name(&self) -> &'static str;
}

/// Provider used when no endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledSuggestionProvider;

#[async_trait]
impl SuggestionProvider for DisabledSuggestionProvider {
    async fn suggest(&self, _code: &str, _cursor_offset: usize) -> String {
        String::new()
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[derive(Debug, Clone)]
pub struct HttpSuggestionProvider {
    client: Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl HttpSuggestionProvider {
    pub fn new(api_base: String, model: String, timeout: Duration) -> Result<Self, CompletionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            api_key: None,
            max_tokens: 128,
        })
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_request_body(&self, prefix: &str, suffix: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("{}{}{}", prefix, CURSOR_MARKER, suffix) },
            ],
        })
    }

    async fn request(&self, prefix: &str, suffix: &str) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self
            .client
            .post(&url)
            .json(&self.build_request_body(prefix, suffix));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(CompletionError::Empty)?;
        Ok(strip_code_fences(content))
    }
}

#[async_trait]
impl SuggestionProvider for HttpSuggestionProvider {
    async fn suggest(&self, code: &str, cursor_offset: usize) -> String {
        let (prefix, suffix) = split_at_cursor(code, cursor_offset);
        match self.request(prefix, suffix).await {
            Ok(suggestion) => {
                log::debug!("Completion provider returned {} bytes", suggestion.len());
                suggestion
            }
            Err(e) => {
                log::warn!("Completion request failed: {}", e);
                String::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Build the provider described by `config`, or the disabled one without an endpoint.
pub fn provider_from_config(
    config: &CompletionConfig,
) -> Result<Arc<dyn SuggestionProvider>, CompletionError> {
    let Some(endpoint) = &config.endpoint else {
        log::info!("No completion endpoint configured; suggestions disabled");
        return Ok(Arc::new(DisabledSuggestionProvider));
    };

    let mut provider = HttpSuggestionProvider::new(
        endpoint.clone(),
        config.model.clone(),
        Duration::from_secs(config.timeout_secs),
    )?
    .with_max_tokens(config.max_tokens);
    if let Some(api_key) = config.resolve_api_key() {
        provider = provider.with_api_key(api_key);
    }
    log::info!("Completion proxy forwarding to {} ({})", endpoint, config.model);
    Ok(Arc::new(provider))
}

/// Split `code` at a character offset, clamped to the end of the text.
pub fn split_at_cursor(code: &str, cursor_offset: usize) -> (&str, &str) {
    let byte_index = code
        .char_indices()
        .nth(cursor_offset)
        .map(|(index, _)| index)
        .unwrap_or(code.len());
    code.split_at(byte_index)
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim_matches('\n');
    if !trimmed.starts_with("```") {
        return content.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().skip(1).collect();
    if lines.last().is_some_and(|line| line.trim() == "```") {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Clone)]
    struct MockState {
        status: StatusCode,
        reply: Value,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    async fn chat_completions(
        State(state): State<MockState>,
        Json(payload): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.requests.lock().unwrap().push(payload);
        (state.status, Json(state.reply.clone()))
    }

    async fn mock_provider(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            status,
            reply,
            requests: requests.clone(),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), requests)
    }

    fn chat_reply(content: &str) -> Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    #[test]
    fn split_uses_character_offsets_and_clamps() {
        assert_eq!(split_at_cursor("print(1)", 6), ("print(", "1)"));
        assert_eq!(split_at_cursor("héllo", 2), ("hé", "llo"));
        assert_eq!(split_at_cursor("abc", 99), ("abc", ""));
        assert_eq!(split_at_cursor("", 0), ("", ""));
    }

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_code_fences("x + 1"), "x + 1");
    }

    #[tokio::test]
    async fn disabled_provider_suggests_nothing() {
        assert_eq!(DisabledSuggestionProvider.suggest("print(", 6).await, "");
    }

    #[tokio::test]
    async fn forwards_prefix_and_suffix_around_cursor() {
        let (endpoint, requests) = mock_provider(StatusCode::OK, chat_reply("2 + 3")).await;
        let provider = HttpSuggestionProvider::new(endpoint, "test-model".to_string(), Duration::from_secs(5))
            .unwrap()
            .with_api_key("sk-test".to_string());

        let suggestion = provider.suggest("print()\n", 6).await;
        assert_eq!(suggestion, "2 + 3");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["model"], "test-model");
        assert_eq!(requests[0]["messages"][1]["content"], "print(<CURSOR>)\n");
    }

    #[tokio::test]
    async fn provider_errors_yield_empty_suggestion() {
        let (endpoint, _) =
            mock_provider(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;
        let provider =
            HttpSuggestionProvider::new(endpoint, "m".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.suggest("x", 1).await, "");

        let (endpoint, _) = mock_provider(StatusCode::OK, json!({ "choices": [] })).await;
        let provider =
            HttpSuggestionProvider::new(endpoint, "m".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.suggest("x", 1).await, "");
    }

    #[tokio::test]
    async fn unreachable_provider_yields_empty_suggestion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = HttpSuggestionProvider::new(
            format!("http://{}/v1", addr),
            "m".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(provider.suggest("x", 1).await, "");
    }

    #[test]
    fn config_without_endpoint_disables_suggestions() {
        let provider = provider_from_config(&CompletionConfig::default()).unwrap();
        assert_eq!(provider.name(), "disabled");

        let config = CompletionConfig {
            endpoint: Some("http://127.0.0.1:9/v1".to_string()),
            ..CompletionConfig::default()
        };
        assert_eq!(provider_from_config(&config).unwrap().name(), "http");
    }
}
