//! In-process tool categories shipped with the core.
//!
//! Only the categories the multiplexer itself needs live here: `session`,
//! `subagent`, and `swarm`. The other configured categories (terminal,
//! workspace, image, github, cron, email, tamias-self, memory) are external
//! collaborators — the registry resolves their configs but contributes no
//! implementations for them.

pub mod session;
pub mod subagent;
pub mod swarm;

use std::sync::Arc;

use crate::registry::ToolHost;
use crate::tool::Tool;

/// Instantiate the built-in tools of one category, bound to the calling
/// session. Names are bare function names; the registry qualifies them.
pub fn category_tools(
    category: &str,
    host: &Arc<dyn ToolHost>,
    session_id: &str,
) -> Vec<Arc<dyn Tool>> {
    match category {
        "subagent" => vec![
            Arc::new(subagent::SpawnTool::new(host.clone(), session_id)) as Arc<dyn Tool>,
            Arc::new(subagent::CallbackTool::new(host.clone(), session_id)),
            Arc::new(subagent::ProgressTool::new(host.clone(), session_id)),
        ],
        "swarm" => vec![
            Arc::new(swarm::TransferToAgentTool::new(host.clone(), session_id)) as Arc<dyn Tool>,
            Arc::new(swarm::ListAgentsTool::new(host.clone())),
        ],
        "session" => vec![
            Arc::new(session::StatusTool::new(host.clone(), session_id)) as Arc<dyn Tool>,
            Arc::new(session::HistoryTool::new(host.clone(), session_id)),
        ],
        _ => Vec::new(),
    }
}
