use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use quill_core::capability::{GenerationRequest, Generator};
use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

use super::Endpoint;

/// Chat-completions style model client.
#[derive(Clone)]
pub struct HttpGenerator {
    endpoint: Endpoint,
    model: String,
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| QuillError::Config("capabilities.generation.model is required".into()))?;
        Ok(Self {
            endpoint: Endpoint::new("generation", config)?,
            model,
        })
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({"model": self.model, "messages": messages});
        if request.json {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

impl Generator for HttpGenerator {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let http = self
                .endpoint
                .client
                .post(self.endpoint.url("chat/completions"))
                .json(&self.body(&request));
            let completion: Completion = self
                .endpoint
                .send(http)
                .await?
                .json()
                .await
                .map_err(|e| QuillError::Capability(format!("generation response: {e}")))?;

            completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| QuillError::Capability("generation returned no content".into()))
        })
    }
}
