//! Wire types for the gateway
//!
//! Two families live here:
//!
//! - **Caller-facing**: [`ChatRequest`], [`Message`], [`Content`], [`McpServerRef`].
//!   These are what clients POST to `/chat`.
//! - **Upstream**: [`UpstreamRequest`], [`InputItem`], [`UpstreamResponse`], [`OutputItem`].
//!   These follow the OpenAI Responses API, where the conversation is an ordered list of
//!   typed input items and tool calls are first-class items rather than message fields.
//!
//! The input-item list is the tool loop's working state: every round appends the model's
//! `function_call` items and our `function_call_output` items, and the whole list is re-sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CALLER-FACING REQUEST
// ============================================================================

/// A chat request as accepted on `POST /chat`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    /// Upstream model name
    #[serde(default)]
    pub model: String,

    /// Ordered conversation
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Return an SSE stream instead of a single JSON object
    #[serde(default)]
    pub stream: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Output token cap; also the quota output estimate when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,

    /// Client-declared tools, either Responses-style or chat-completions-style
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Remote tool servers the caller wants available for this turn
    #[serde(default, alias = "mcp", skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerRef>,

    /// Explicit MCP switch; unset means "on when servers are present"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_mcp: Option<bool>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Whether MCP dispatch is allowed for this request
    pub fn mcp_enabled(&self) -> bool {
        self.enable_mcp.unwrap_or(!self.mcp_servers.is_empty())
    }

    /// Whether any MCP server carries a caller-supplied key
    pub fn has_mcp_secrets(&self) -> bool {
        self.mcp_servers.iter().any(McpServerRef::has_api_key)
    }

    /// Text of the last user message, if any
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_text())
    }
}

/// One conversation message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,

    #[serde(default)]
    pub content: Content,

    /// Inline files; images become `input_image` parts, UTF-8 text becomes `input_text`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Content::Text(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new("system", text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new("assistant", text)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Message content: plain text or an ordered list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// All text in the content, parts joined with newlines
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Character count used for token estimation; images count as a fixed cost
    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(text) => text.chars().count(),
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => IMAGE_CHAR_COST,
                    ContentPart::Unsupported => 0,
                })
                .sum(),
        }
    }
}

/// Rough character-equivalent charged for an image part
pub const IMAGE_CHAR_COST: usize = 1024;

/// A typed content part in the caller's (chat-completions) vocabulary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Unsupported,
}

/// `image_url` may be a bare URL string or `{url, detail}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ImageUrl {
    Url(String),
    Object {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ImageUrl {
    pub fn url(&self) -> &str {
        match self {
            ImageUrl::Url(url) => url,
            ImageUrl::Object { url, .. } => url,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ImageUrl::Url(_) => None,
            ImageUrl::Object { detail, .. } => detail.as_deref(),
        }
    }
}

/// An inline file attached to a message; `data` is base64
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(alias = "mime_type", alias = "type")]
    pub content_type: String,

    pub data: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// A remote MCP tool server the caller wants to use
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpServerRef {
    pub url: String,

    /// Path prefix applied to the server's origin when guessing endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tools exposed from this server; empty means all of them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_tool_names: Vec<String>,

    /// Tool definitions the client already fetched from this server
    #[serde(default, alias = "tools", skip_serializing_if = "Vec::is_empty")]
    pub cached_tool_defs: Vec<McpToolDef>,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for McpServerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerRef")
            .field("url", &self.url)
            .field("url_prefix", &self.url_prefix)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("enabled", &self.enabled)
            .field("enabled_tool_names", &self.enabled_tool_names)
            .field("cached_tool_defs", &self.cached_tool_defs.len())
            .finish()
    }
}

impl McpServerRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    pub fn with_tool(mut self, def: McpToolDef) -> Self {
        self.cached_tool_defs.push(def);
        self
    }

    /// A non-blank caller-supplied key
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Whether the named tool passes this server's allow-list
    pub fn tool_enabled(&self, name: &str) -> bool {
        self.enabled_tool_names.is_empty() || self.enabled_tool_names.iter().any(|n| n == name)
    }

    /// Cached, named, allow-listed tool definitions
    pub fn exposed_tools(&self) -> impl Iterator<Item = &McpToolDef> {
        self.cached_tool_defs
            .iter()
            .filter(|d| !d.name.trim().is_empty() && self.tool_enabled(&d.name))
    }

    /// Whether this server is enabled and exposes the named tool
    pub fn provides(&self, name: &str) -> bool {
        self.enabled && self.exposed_tools().any(|d| d.name == name)
    }
}

/// A tool definition advertised by an MCP server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpToolDef {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(
        default,
        alias = "inputSchema",
        alias = "input_schema",
        skip_serializing_if = "Option::is_none"
    )]
    pub parameters: Option<Value>,
}

impl McpToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

// ============================================================================
// UPSTREAM (RESPONSES API)
// ============================================================================

/// Body of `POST {api_base}/v1/responses`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamRequest {
    pub model: String,

    pub input: Vec<InputItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default)]
    pub stream: bool,

    /// Always false: the gateway re-sends the full input every round
    #[serde(default)]
    pub store: bool,
}

impl UpstreamRequest {
    /// Names of the declared function tools, in declaration order
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningConfig {
    pub effort: String,
}

/// One entry of the upstream `input` list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: String,
        content: Vec<InputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl InputItem {
    pub fn message(role: impl Into<String>, text: impl Into<String>) -> Self {
        let role = role.into();
        let text = text.into();
        let part = if role == "assistant" {
            InputContent::OutputText { text }
        } else {
            InputContent::InputText { text }
        };
        InputItem::Message {
            role,
            content: vec![part],
        }
    }

    pub fn function_call(call: &ToolCall) -> Self {
        InputItem::FunctionCall {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        InputItem::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        }
    }
}

/// A content part inside an upstream message item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
    InputText {
        text: String,
    },
    InputImage {
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Prior assistant turns are replayed as output text
    OutputText {
        text: String,
    },
}

/// Body of a (non-streaming) upstream response, or the payload of `response.completed`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamResponse {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub output: Vec<OutputItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UpstreamResponse {
    /// Concatenated `output_text` parts of all message items
    pub fn output_text(&self) -> String {
        let mut text = String::new();
        for item in &self.output {
            if let OutputItem::Message { content } = item {
                for part in content {
                    if let OutputContent::OutputText { text: t } = part {
                        text.push_str(t);
                    }
                }
            }
        }
        text
    }

    /// Reasoning text, preferring the full trace over the summary
    pub fn reasoning_text(&self) -> String {
        let mut pieces = Vec::new();
        for item in &self.output {
            if let OutputItem::Reasoning { summary, content } = item {
                let source = if content.is_empty() { summary } else { content };
                pieces.extend(
                    source
                        .iter()
                        .map(|p| p.text.as_str())
                        .filter(|t| !t.is_empty()),
                );
            }
        }
        pieces.join("\n")
    }

    /// Structured function calls, in output order
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// One entry of the upstream `output` list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<ReasoningPart>,
        #[serde(default)]
        content: Vec<ReasoningPart>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText {
        text: String,
    },
    Refusal {
        refusal: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasoningPart {
    #[serde(default)]
    pub text: String,
}

/// Token usage reported by the upstream
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    /// Accumulate another round's usage
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A tool invocation requested by the model; consumed exactly once per round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Arguments parsed as JSON; blank input is an empty object
    pub fn parsed_arguments(&self) -> crate::Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
            .map_err(|e| crate::Error::tool(format!("invalid arguments: {}", e)))
    }
}

// ============================================================================
// CALLER IDENTITY
// ============================================================================

/// A resolved caller
#[derive(Clone, Default, PartialEq)]
pub struct UserConfig {
    /// Stable user identifier, used as the quota key
    pub user: String,

    /// Upstream base URL for this caller
    pub api_base: String,

    /// Upstream bearer token for this caller
    pub openai_token: String,

    /// Free-tier callers are quota-gated and MCP rate-limited
    pub is_free: bool,

    /// Bearer token the caller authenticated with; MCP auth falls back to it
    pub caller_token: Option<String>,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("user", &self.user)
            .field("api_base", &self.api_base)
            .field("openai_token", &"***")
            .field("is_free", &self.is_free)
            .field("caller_token", &self.caller_token.as_ref().map(|_| "***"))
            .finish()
    }
}
