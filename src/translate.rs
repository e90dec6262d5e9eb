//! Caller request → upstream Responses-API request
//!
//! Tool declarations are merged in priority order: tools the caller declared, then tools
//! exposed by the caller's enabled MCP servers, then the local built-ins. A later source
//! never shadows a name an earlier one already declared.

use crate::config::GatewayConfig;
use crate::tools::ToolRegistry;
use crate::types::{
    Attachment, ChatRequest, Content, ContentPart, InputContent, InputItem, McpToolDef, Message,
    ReasoningConfig, UpstreamRequest,
};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::collections::HashSet;

/// Build the first-round upstream request
pub fn translate(
    request: &ChatRequest,
    registry: &ToolRegistry,
    config: &GatewayConfig,
) -> Result<UpstreamRequest> {
    if request.messages.is_empty() {
        return Err(Error::invalid_request("messages must not be empty"));
    }
    if request.model.trim().is_empty() {
        return Err(Error::invalid_request("model must not be empty"));
    }

    let input = request
        .messages
        .iter()
        .map(translate_message)
        .collect::<Result<Vec<_>>>()?;

    let tools = collect_tools(request, registry);
    let tool_choice = match (&request.tool_choice, tools.is_empty()) {
        (Some(choice), false) => Some(choice.clone()),
        (None, false) => Some(json!("auto")),
        (_, true) => None,
    };

    let effort = request
        .reasoning_effort
        .clone()
        .filter(|e| !e.trim().is_empty())
        .or_else(|| forced_reasoning_effort(&request.model, config));

    Ok(UpstreamRequest {
        model: request.model.clone(),
        input,
        tools,
        tool_choice,
        reasoning: effort.map(|effort| ReasoningConfig { effort }),
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stream: request.stream,
        store: false,
    })
}

/// The configured default effort, if `model` belongs to a reasoning family
pub fn forced_reasoning_effort(model: &str, config: &GatewayConfig) -> Option<String> {
    let model = model.to_ascii_lowercase();
    let bare = model.rsplit('/').next().unwrap_or(&model);
    config
        .reasoning_model_prefixes
        .iter()
        .any(|prefix| bare.starts_with(&prefix.to_ascii_lowercase()))
        .then(|| config.default_reasoning_effort.clone())
}

fn upstream_role(role: &str) -> &str {
    match role {
        "system" | "developer" | "assistant" | "user" => role,
        _ => "user",
    }
}

fn translate_message(message: &Message) -> Result<InputItem> {
    let role = upstream_role(&message.role).to_string();
    let assistant = role == "assistant";
    let text_part = |text: String| {
        if assistant {
            InputContent::OutputText { text }
        } else {
            InputContent::InputText { text }
        }
    };

    let mut content = Vec::new();
    match &message.content {
        Content::Text(text) => {
            if !text.is_empty() || message.attachments.is_empty() {
                content.push(text_part(text.clone()));
            }
        }
        Content::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => content.push(text_part(text.clone())),
                    ContentPart::ImageUrl { image_url } if !assistant => {
                        content.push(InputContent::InputImage {
                            image_url: image_url.url().to_string(),
                            detail: image_url.detail().map(str::to_string),
                        })
                    }
                    ContentPart::ImageUrl { .. } | ContentPart::Unsupported => {}
                }
            }
        }
    }

    if !assistant {
        for attachment in &message.attachments {
            content.push(attachment_part(attachment)?);
        }
    }

    if content.is_empty() {
        content.push(text_part(String::new()));
    }
    Ok(InputItem::Message { role, content })
}

/// Every attachment travels as an inline base64 `input_image` data URL
fn attachment_part(attachment: &Attachment) -> Result<InputContent> {
    let data = attachment.data.trim();
    if let Err(e) = STANDARD.decode(data) {
        let label = attachment.name.as_deref().unwrap_or("attachment");
        return Err(Error::invalid_request(format!(
            "attachment '{}' is not base64: {}",
            label, e
        )));
    }
    if !attachment.is_image() {
        log::debug!(
            "sending non-image attachment as input_image ({})",
            attachment.content_type
        );
    }
    Ok(InputContent::InputImage {
        image_url: format!("data:{};base64,{}", attachment.content_type, data),
        detail: None,
    })
}

fn collect_tools(request: &ChatRequest, registry: &ToolRegistry) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut tools = Vec::new();
    let mut push = |decl: Value, tools: &mut Vec<Value>| {
        let name = decl.get("name").and_then(Value::as_str).map(str::to_string);
        match name {
            Some(name) if seen.insert(name.clone()) => tools.push(decl),
            Some(name) => log::debug!("tool '{}' already declared; skipping", name),
            None => tools.push(decl),
        }
    };

    for decl in &request.tools {
        if let Some(decl) = normalize_client_tool(decl) {
            push(decl, &mut tools);
        }
    }
    if request.mcp_enabled() {
        for server in request.mcp_servers.iter().filter(|s| s.enabled) {
            for def in server.exposed_tools() {
                push(mcp_declaration(def), &mut tools);
            }
        }
    }
    for decl in registry.declarations() {
        push(decl, &mut tools);
    }
    tools
}

/// Accept both the flat Responses shape and the nested chat-completions
/// `{"type":"function","function":{..}}` shape
pub fn normalize_client_tool(decl: &Value) -> Option<Value> {
    match decl.get("function") {
        Some(function) => {
            let name = function.get("name").and_then(Value::as_str)?;
            let mut flat = json!({
                "type": "function",
                "name": name,
                "parameters": function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
            if let Some(description) = function.get("description") {
                flat["description"] = description.clone();
            }
            Some(flat)
        }
        None if decl.get("type").and_then(Value::as_str) == Some("function") => {
            decl.get("name").and_then(Value::as_str)?;
            Some(decl.clone())
        }
        // Hosted tools (web_search, file_search, ...) pass through untouched.
        None => decl.get("type").is_some().then(|| decl.clone()),
    }
}

fn mcp_declaration(def: &McpToolDef) -> Value {
    json!({
        "type": "function",
        "name": def.name,
        "description": def.description.clone().unwrap_or_default(),
        "parameters": def
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::current_time_tool;
    use crate::types::{ImageUrl, McpServerRef};

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(current_time_tool());
        registry
    }

    #[test]
    fn test_empty_messages_rejected() {
        let req = ChatRequest::new("gpt-4o", vec![]);
        let err = translate(&req, &registry(), &GatewayConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_message_shapes() {
        let req = ChatRequest::new(
            "gpt-4o",
            vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message {
                    role: "user".into(),
                    content: Content::Parts(vec![
                        ContentPart::Text { text: "look".into() },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl::Url("https://x/cat.png".into()),
                        },
                    ]),
                    attachments: vec![],
                },
            ],
        );
        let out = translate(&req, &ToolRegistry::new(), &GatewayConfig::default()).unwrap();

        assert_eq!(out.input[0], InputItem::message("system", "be brief"));
        assert_eq!(out.input[2], InputItem::message("assistant", "hello"));
        let InputItem::Message { content, .. } = &out.input[3] else {
            panic!("expected message");
        };
        assert_eq!(content[0], InputContent::InputText { text: "look".into() });
        assert_eq!(
            content[1],
            InputContent::InputImage {
                image_url: "https://x/cat.png".into(),
                detail: None
            }
        );
        assert!(out.tools.is_empty());
        assert!(out.tool_choice.is_none());
        assert!(!out.store);
    }

    #[test]
    fn test_attachments() {
        let message = Message::user("see files")
            .with_attachment(Attachment {
                name: Some("dot.png".into()),
                content_type: "image/png".into(),
                data: "iVBORw0KGgo=".into(),
            })
            .with_attachment(Attachment {
                name: Some("notes.txt".into()),
                content_type: "text/plain".into(),
                data: STANDARD.encode("remember milk"),
            });
        let req = ChatRequest::new("gpt-4o", vec![message]);
        let out = translate(&req, &ToolRegistry::new(), &GatewayConfig::default()).unwrap();

        let InputItem::Message { content, .. } = &out.input[0] else {
            panic!("expected message");
        };
        assert_eq!(content.len(), 3);
        assert_eq!(
            content[1],
            InputContent::InputImage {
                image_url: "data:image/png;base64,iVBORw0KGgo=".into(),
                detail: None
            }
        );
        assert_eq!(
            content[2],
            InputContent::InputImage {
                image_url: format!("data:text/plain;base64,{}", STANDARD.encode("remember milk")),
                detail: None
            }
        );

        let bad = ChatRequest::new(
            "gpt-4o",
            vec![Message::user("x").with_attachment(Attachment {
                name: None,
                content_type: "image/png".into(),
                data: "not base64!!".into(),
            })],
        );
        assert!(matches!(
            translate(&bad, &ToolRegistry::new(), &GatewayConfig::default()),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_tool_priority_and_filtering() {
        let mut req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        req.tools = vec![
            json!({"type": "function", "function": {"name": "lookup", "description": "client"}}),
            json!({"type": "function", "name": "current_time", "parameters": {}}),
        ];
        let mut disabled = McpServerRef::new("http://off")
            .with_tool(McpToolDef::new("hidden", "from disabled server"));
        disabled.enabled = false;
        let mut server = McpServerRef::new("http://mcp")
            .with_tool(McpToolDef::new("lookup", "mcp duplicate"))
            .with_tool(McpToolDef::new("weather", "forecast"))
            .with_tool(McpToolDef::new("stocks", "not allow-listed"))
            .with_tool(McpToolDef::new("", "nameless"));
        server.enabled_tool_names = vec!["lookup".into(), "weather".into(), "".into()];
        req.mcp_servers = vec![disabled, server];

        let out = translate(&req, &registry(), &GatewayConfig::default()).unwrap();
        assert_eq!(out.tool_names(), vec!["lookup", "current_time", "weather"]);
        assert_eq!(out.tools[0]["description"], "client");
        assert_eq!(out.tool_choice, Some(json!("auto")));
    }

    #[test]
    fn test_mcp_tools_skipped_when_disabled() {
        let mut req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        req.mcp_servers =
            vec![McpServerRef::new("http://mcp").with_tool(McpToolDef::new("w", "W"))];
        req.enable_mcp = Some(false);
        let out = translate(&req, &ToolRegistry::new(), &GatewayConfig::default()).unwrap();
        assert!(out.tools.is_empty());
    }

    #[test]
    fn test_reasoning_effort() {
        let config = GatewayConfig::default();
        let mut req = ChatRequest::new("o3-mini", vec![Message::user("hi")]);
        let out = translate(&req, &ToolRegistry::new(), &config).unwrap();
        assert_eq!(out.reasoning.map(|r| r.effort), Some("high".to_string()));

        req.reasoning_effort = Some("low".into());
        let out = translate(&req, &ToolRegistry::new(), &config).unwrap();
        assert_eq!(out.reasoning.map(|r| r.effort), Some("low".to_string()));

        let req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        assert!(translate(&req, &ToolRegistry::new(), &config).unwrap().reasoning.is_none());
        assert_eq!(
            forced_reasoning_effort("openai/GPT-5-mini", &config),
            Some("high".to_string())
        );
    }

    #[test]
    fn test_normalize_client_tool() {
        assert!(normalize_client_tool(&json!({"function": {"description": "no name"}})).is_none());
        assert_eq!(
            normalize_client_tool(&json!({"type": "web_search"})),
            Some(json!({"type": "web_search"}))
        );
        let flat = normalize_client_tool(&json!({"type": "function", "function": {"name": "f"}}))
            .unwrap();
        assert_eq!(flat["name"], "f");
        assert_eq!(flat["parameters"]["type"], "object");
    }
}
