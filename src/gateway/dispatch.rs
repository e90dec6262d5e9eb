use super::{Gateway, PreparedTurn};
use crate::mcp::{SessionTable, resolve_server};
use crate::types::ToolCall;
use crate::{Error, Result};

impl Gateway {
    /// Execute one tool call: local tools by name first, then the caller's MCP servers.
    ///
    /// Errors here are tool-level; the loop feeds them back to the model.
    pub(super) async fn dispatch(
        &self,
        turn: &PreparedTurn,
        sessions: &mut SessionTable,
        call: &ToolCall,
    ) -> Result<String> {
        let arguments = call.parsed_arguments()?;

        if let Some(tool) = self.registry.get(&call.name) {
            log::debug!("{}: local tool {}", turn.request_id, call.name);
            return tool.execute(arguments).await;
        }

        if !turn.request.mcp_enabled() {
            return Err(Error::tool(format!("tool '{}' not found", call.name)));
        }
        let server = resolve_server(&turn.request.mcp_servers, &call.name)
            .ok_or_else(|| Error::tool(format!("tool '{}' not found", call.name)))?;

        if turn.user.is_free {
            if let Err(wait) = self.rate_limiter.try_acquire() {
                log::info!(
                    "{}: MCP call to {} throttled for {}s",
                    turn.request_id,
                    call.name,
                    wait.as_secs()
                );
                return Err(Error::tool(format!(
                    "MCP rate limit exceeded, retry in {}s",
                    wait.as_secs()
                )));
            }
        }

        log::debug!("{}: MCP tool {} via {}", turn.request_id, call.name, server.url);
        self.mcp
            .call_tool(
                server,
                sessions,
                &call.name,
                &arguments,
                turn.user.caller_token.as_deref(),
            )
            .await
    }
}
