//! Tool calls requested by the model
//!
//! The backend forwards each function call as a `voice_generation_request`.
//! The client runs it through a [`ToolExecutor`] and, when a file was
//! generated, echoes `generation_completed` with the original call id.

use crate::error::{LiveError, Result};
use crate::protocol::{GenerationCompleted, GenerationRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

/// A function call waiting for its result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFunctionCall {
    /// Correlation id, echoed as `function_call_id`
    pub call_id: String,
    pub function_name: String,
    pub function_args: Value,
    /// What the user asked for, in their words
    pub text: String,
}

impl From<GenerationRequest> for PendingFunctionCall {
    fn from(request: GenerationRequest) -> Self {
        Self {
            call_id: request.function_call_id,
            function_name: request.function_name,
            function_args: request.function_args,
            text: request.text,
        }
    }
}

impl PendingFunctionCall {
    /// Whether the call asks for the camera (or uploaded images) as reference.
    pub fn refers_to_camera(&self) -> bool {
        self.function_name == "generate_image"
            && self
                .function_args
                .get("refers_to_camera")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Progress message shown while the call runs.
    pub fn progress_message(&self) -> &'static str {
        match self.function_name.as_str() {
            "generate_image" => "Generating image...",
            "generate_video" => "Generating video...",
            "extract_frame" => "Extracting frame...",
            "combine_videos" => "Combining videos...",
            _ => "Processing...",
        }
    }
}

/// Session data a tool call may need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolContext {
    pub session_id: String,
    /// Data URLs attached as `reference_images`
    pub reference_images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Value,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl GeneratedFile {
    pub fn location(&self) -> Option<&str> {
        self.path.as_deref().or(self.url.as_deref())
    }
}

/// What the executor returned. Any combination of the fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationOutcome {
    #[serde(default)]
    pub file: Option<GeneratedFile>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationOutcome {
    /// The `generation_completed` payload for `call`, if a file was produced.
    pub fn completion_for(&self, call: &PendingFunctionCall) -> Option<GenerationCompleted> {
        self.file.as_ref().map(|file| GenerationCompleted {
            kind: file.kind.clone(),
            id: file.id.clone(),
            function_call_id: call.call_id.clone(),
            user_request: call.text.clone(),
        })
    }
}

/// Runs tool calls. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ToolExecutor: Send + Sync + 'static {
    async fn execute(&self, call: &PendingFunctionCall, ctx: &ToolContext) -> Result<GenerationOutcome>;

    /// Drop server-side content of a session.
    async fn clear_session(&self, session_id: &str) -> Result<()> {
        debug!("No server-side state to clear for {}", session_id);
        Ok(())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    session_id: &'a str,
    function_name: &'a str,
    function_args: Value,
    function_call_id: &'a str,
}

/// Executes tool calls through the backend's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpToolExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpToolExecutor {
    pub fn new(server_url: &str) -> Result<Self> {
        let trimmed = server_url.trim().trim_end_matches('/');
        let base_url = if let Some(rest) = trimmed.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = trimmed.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            return Err(LiveError::Config(format!(
                "tool executor needs an http(s) or ws(s) url, got {:?}",
                server_url
            )));
        };
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}/api/genmedia-chat", self.base_url)
    }

    pub fn clear_endpoint(&self) -> String {
        format!("{}/api/clear-all", self.base_url)
    }
}

/// Function arguments with the reference images merged in.
pub fn request_args(call: &PendingFunctionCall, ctx: &ToolContext) -> Value {
    let mut args = match &call.function_args {
        Value::Object(map) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if call.function_name == "generate_image" && !ctx.reference_images.is_empty() {
        args["reference_images"] = json!(ctx.reference_images);
    }
    args
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, call: &PendingFunctionCall, ctx: &ToolContext) -> Result<GenerationOutcome> {
        let request = ChatRequest {
            session_id: &ctx.session_id,
            function_name: &call.function_name,
            function_args: request_args(call, ctx),
            function_call_id: &call.call_id,
        };

        info!("🛠️ {} ({})", call.function_name, call.call_id);
        let response = self
            .client
            .post(self.chat_endpoint())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LiveError::Tool(format!("HTTP {}: {}", status, body)));
        }

        Ok(response.json::<GenerationOutcome>().await?)
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.clear_endpoint())
            .json(&json!({ "session_id": session_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LiveError::Tool(format!("clear failed: HTTP {}", response.status())));
        }
        Ok(())
    }
}
