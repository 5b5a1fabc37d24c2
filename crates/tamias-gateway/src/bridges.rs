//! Build, register, and connect every enabled bridge from config.

use std::sync::Arc;

use tracing::{info, warn};

use tamias_agent::agents::AgentsStore;
use tamias_bridges::Bridge;
use tamias_discord::DiscordBridge;
use tamias_telegram::TelegramBridge;
use tamias_terminal::TerminalBridge;
use tamias_whatsapp::WhatsappBridge;

use crate::app::AppState;

/// Connect failures are logged and skipped — one dead bridge never blocks
/// the daemon. `interactive` gates the terminal bridge: a detached daemon
/// has no stdin to read.
pub async fn start_bridges(state: &Arc<AppState>, agents: &Arc<AgentsStore>, interactive: bool) {
    let bridges = state.config().bridges.clone();
    let debug = state.config().debug;

    if bridges.terminal.enabled && interactive {
        let bridge = TerminalBridge::new(Arc::clone(&state.store), Arc::clone(agents), debug);
        connect_and_register(state, bridge).await;
    }

    for (key, config) in &bridges.discords {
        if !config.enabled {
            continue;
        }
        let bridge = DiscordBridge::new(
            key,
            config.clone(),
            Arc::clone(&state.store),
            Arc::clone(agents),
        );
        connect_and_register(state, bridge).await;
    }

    for (key, config) in &bridges.telegrams {
        if !config.enabled {
            continue;
        }
        let bridge = TelegramBridge::new(
            key,
            config.clone(),
            Arc::clone(&state.store),
            Arc::clone(agents),
        );
        connect_and_register(state, bridge).await;
    }

    for (key, config) in &bridges.whatsapps {
        if !config.enabled {
            continue;
        }
        let bridge = WhatsappBridge::new(
            key,
            config.clone(),
            Arc::clone(&state.store),
            Arc::clone(agents),
        );
        state
            .whatsapp
            .insert(bridge.name().to_string(), Arc::clone(&bridge));
        connect_and_register(state, bridge).await;
    }
}

async fn connect_and_register<B: Bridge + 'static>(state: &Arc<AppState>, bridge: Arc<B>) {
    let name = bridge.name().to_string();
    match bridge.connect().await {
        Ok(()) => {
            info!(bridge = %name, "bridge connected");
            state.dispatcher.register_bridge(bridge);
        }
        Err(e) => {
            warn!(bridge = %name, error = %e, "bridge connect failed, skipping");
        }
    }
}
