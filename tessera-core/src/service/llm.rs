use async_trait::async_trait;
use serde_json::{json, Value};

use super::{classify_status, CallError, LlmRequest, LlmResponse, LlmService};

/// OpenAI-compatible chat completions client with JSON-schema output.
#[derive(Debug, Clone)]
pub struct HttpLlmService {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmService {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_owned(),
            api_key,
        }
    }

    fn body(&self, request: &LlmRequest) -> Value {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        content.extend(request.images.iter().map(|img| {
            json!({ "type": "image_url", "image_url": { "url": img.data_url() } })
        }));
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "block_update", "schema": request.schema, "strict": false }
            }
        })
    }
}

/// Pulls the structured answer and token count out of a chat completion.
fn parse_completion(reply: &Value) -> Result<LlmResponse, CallError> {
    let content = reply
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::Transient("completion has no message content".into()))?;
    if content.trim().is_empty() {
        return Err(CallError::Transient("empty completion".into()));
    }
    let value: Value = serde_json::from_str(content)
        .map_err(|e| CallError::Rejected(format!("completion is not JSON: {e}")))?;
    let tokens_used = reply
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    Ok(LlmResponse { value, tokens_used })
}

#[async_trait]
impl LlmService for HttpLlmService {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, CallError> {
        let mut req = self.client.post(&self.url).json(&self.body(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CallError::Transient(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        let reply: Value = serde_json::from_str(&text)
            .map_err(|e| CallError::Rejected(format!("malformed reply: {e}")))?;
        parse_completion(&reply)
    }
}
