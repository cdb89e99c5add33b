//! Wire-format request/response and streaming-frame models shared by the
//! HTTP and WebSocket surfaces. Kept free of any server or process-spawning
//! logic so it can be depended on by both the server and test harnesses.

use gw_types::{ErrorBody, ModelAlias, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// POST /v1/chat/completions body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: ModelAlias,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub cost_usd: f64,
}

/// POST /v1/process body — the compatibility adapter's provider-agnostic shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    pub provider: String,
    pub model_name: String,
    pub user_message: String,
    #[serde(default)]
    pub use_cli: bool,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub path: &'static str,
}

/// POST /v1/task body — agentic executor entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct AgenticTaskRequest {
    pub description: String,
    #[serde(default)]
    pub allow_tools: Vec<String>,
    #[serde(default)]
    pub allow_agents: Vec<String>,
    #[serde(default)]
    pub allow_skills: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    pub timeout_seconds: u64,
    pub max_cost_usd: f64,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgenticTaskResponse {
    pub task_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    pub execution_log: Vec<ExecutionEvent>,
    pub artifacts: Vec<ArtifactInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ToolCall { name: String, args: Value },
    ToolResult { name: String, output: Value },
    AgentSpawn { agent: String },
    SkillInvoke { skill: String },
    Thinking { text: String },
    Result { text: String, usage: Usage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// POST /v1/batch body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub model: ModelAlias,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResult>,
}

/// Client → server WebSocket frame on `/v1/stream`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat {
        model: ModelAlias,
        messages: Vec<ChatMessage>,
        #[serde(default)]
        project_id: Option<String>,
    },
}

/// Server → client WebSocket frame on `/v1/stream`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Token {
        content: String,
    },
    Done {
        usage: Usage,
        cost_usd: f64,
        model: String,
    },
    Error {
        error: ErrorBody,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageQueryResponse {
    pub project_id: String,
    pub period: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub request_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilitiesResponse {
    pub agents: Vec<String>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub worker_pool: WorkerPoolStatus,
    pub budget_store: &'static str,
    pub auth_store: &'static str,
    pub cache: &'static str,
    pub uptime_s: u64,
    pub draining: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStatus {
    pub active: usize,
    pub queued: usize,
    pub max_workers: usize,
}
