//! # Local tools
//!
//! Tools the gateway executes in-process, as opposed to tools living on a caller's MCP
//! servers. A [`Tool`] pairs a name, a description and a JSON Schema with an async
//! handler; a [`ToolRegistry`] is the name→implementation table the tool loop consults
//! before falling back to MCP resolution.
//!
//! ## Schema Conversion
//!
//! Schemas may be written in three shapes, all normalized to JSON Schema:
//!
//! - **Simple notation**: `{"query": "string", "limit": "integer"}`
//! - **Typed properties**: `{"query": {"type": "string", "description": "..."}}`
//! - **Full JSON Schema**: passed through untouched
//!
//! ## Built-ins
//!
//! - `current_time` is always registered.
//! - `search_web` is registered when a search endpoint is configured.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use tool_gateway::{tool, ToolRegistry};
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(
//!     tool("shout", "Upper-case a piece of text")
//!         .param("text", "string")
//!         .build(|args| async move {
//!             Ok(args["text"].as_str().unwrap_or_default().to_uppercase())
//!         }),
//! );
//! assert!(registry.contains("shout"));
//! ```

use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Async tool handler: JSON arguments in, text result out.
///
/// `Arc` so registries can be cloned per request; `Pin<Box<..>>` so handlers with
/// different future types fit in one table.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

/// A locally executed tool
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    /// Normalized JSON Schema of the arguments object
    input_schema: Value,
    handler: ToolHandler,
}

impl Tool {
    /// Create a tool; `input_schema` may use any of the accepted shapes
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: convert_schema(input_schema),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Run the handler
    pub async fn execute(&self, arguments: Value) -> Result<String> {
        (self.handler)(arguments).await
    }

    /// Declaration in the Responses API's flat function-tool shape
    pub fn to_responses_format(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// The argument a positional inline call like `name("x")` binds to: the first
    /// required parameter, else the first declared one
    pub fn first_param(&self) -> Option<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .or_else(|| {
                self.input_schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .and_then(|p| p.keys().next())
                    .map(String::as_str)
            })
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Normalize the accepted schema shapes to a JSON Schema object.
///
/// Per-property `"optional": true`, `"required": false` or a `"default"` make a
/// parameter optional; `"required": true` forces it. Everything else is required.
fn convert_schema(schema: Value) -> Value {
    let Value::Object(obj) = schema else {
        return json!({"type": "object", "properties": {}, "required": []});
    };
    if obj.contains_key("type") && obj.contains_key("properties") {
        return Value::Object(obj);
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        match param_type {
            Value::String(type_str) => {
                properties.insert(param_name.clone(), type_to_json_schema(&type_str));
                required.push(param_name);
            }
            Value::Object(mut prop) => {
                let is_optional = prop
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop.remove("required").and_then(|v| v.as_bool());
                let has_default = prop.contains_key("default");

                properties.insert(param_name.clone(), Value::Object(prop));

                let required_here = match is_required {
                    Some(flag) => flag,
                    None => !is_optional && !has_default,
                };
                if required_here {
                    required.push(param_name);
                }
            }
            _ => {}
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Map friendly type names (`str`, `i64`, `vec`, `dict`, ...) to JSON Schema types
fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({ "type": json_type })
}

/// Fluent builder returned by [`tool()`]
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: json!({}),
        }
    }

    /// Replace the whole schema
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Add one required parameter in simple notation
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = json!({});
        }
        if let Value::Object(obj) = &mut self.schema {
            obj.insert(name.to_string(), Value::String(type_str.to_string()));
        }
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Tool::new(self.name, self.description, self.schema, handler)
    }
}

/// Start building a tool
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// Name→tool lookup table, in registration order
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tools enabled by the given settings
    pub fn with_builtins(http: reqwest::Client, search_api_url: Option<&str>) -> Self {
        let mut registry = Self::new();
        registry.register(current_time_tool());
        if let Some(url) = search_api_url {
            registry.register(search_web_tool(http, url));
        }
        registry
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Tool) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == tool.name) {
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    /// Upstream declarations for every registered tool
    pub fn declarations(&self) -> Vec<Value> {
        self.tools.iter().map(Tool::to_responses_format).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// BUILT-IN TOOLS
// ============================================================================

/// `current_time`: the current UTC time in RFC 3339
pub fn current_time_tool() -> Tool {
    tool(
        "current_time",
        "Get the current date and time in UTC (RFC 3339).",
    )
    .build(|_| async {
        Ok(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { results: Vec<SearchResult> },
    Bare(Vec<SearchResult>),
}

#[derive(Debug, Default, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "link")]
    url: String,
    #[serde(default, alias = "content", alias = "description")]
    snippet: String,
    #[serde(default, alias = "additionalText")]
    additional_text: String,
}

/// `search_web(query)`: POSTs `{query}` to a search endpoint and formats the hits
pub fn search_web_tool(http: reqwest::Client, url: impl Into<String>) -> Tool {
    let url: String = url.into();
    tool(
        "search_web",
        "Search the web and return the top results with titles, links and snippets.",
    )
    .schema(json!({
        "query": {"type": "string", "description": "What to search for"}
    }))
    .build(move |args| {
        let http = http.clone();
        let url = url.clone();
        async move {
            let query = args
                .get("query")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .ok_or_else(|| Error::tool("search_web requires a non-empty 'query'"))?
                .to_string();

            let response = http.post(url.as_str()).json(&json!({ "query": query })).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::tool(format!("search endpoint returned {}", status)));
            }
            let parsed: SearchResponse = response.json().await?;
            let results = match parsed {
                SearchResponse::Wrapped { results } => results,
                SearchResponse::Bare(results) => results,
            };
            Ok(format_search_results(&query, &results))
        }
    })
}

fn format_search_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No results found for \"{}\".", query);
    }
    results
        .iter()
        .map(|r| {
            let mut block = Vec::new();
            for field in [&r.title, &r.url, &r.snippet] {
                if !field.trim().is_empty() {
                    block.push(field.trim());
                }
            }
            if !r.additional_text.trim().is_empty() {
                block.push(r.additional_text.trim());
            }
            block.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
