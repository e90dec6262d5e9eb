//! Tool calls written into reply text
//!
//! Some models answer `search_web("Ottawa weather")` in prose instead of emitting a
//! structured function call. When a round has no structured calls, calls to registered
//! local tools written this way are lifted into synthetic [`ToolCall`]s.

use crate::tools::ToolRegistry;
use crate::types::ToolCall;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// `name("arg")` or `name('arg')`, backslash escapes allowed inside the quotes
static INLINE_CALL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"\b([A-Za-z_][A-Za-z0-9_]*)\(\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')\s*\)"#).ok()
});

/// Synthetic calls for every inline invocation of a registered tool, in text order
pub fn extract_calls(text: &str, registry: &ToolRegistry, round: u32) -> Vec<ToolCall> {
    let Some(pattern) = INLINE_CALL.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str();
            let tool = registry.get(name)?;
            let raw = caps.get(2).or_else(|| caps.get(3))?.as_str();
            let mut arguments = Map::new();
            if let Some(param) = tool.first_param() {
                arguments.insert(param.to_string(), Value::String(unescape(raw)));
            }
            Some((name.to_string(), Value::Object(arguments).to_string()))
        })
        .enumerate()
        .map(|(n, (name, arguments))| {
            ToolCall::new(format!("inline_{}_{}", round, n), name, arguments)
        })
        .collect()
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
