use {
    anyhow::{Result, bail},
    clap::Subcommand,
    hublink_config::HublinkConfig,
    hublink_gateway::AppState,
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Show every saved vendor session.
    Status,
    /// Forget a saved session and the devices paired through it.
    Logout {
        /// Session id, as shown by `hublink auth status`.
        #[arg(long)]
        session: String,
    },
}

pub fn handle_auth(config: HublinkConfig, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Status => status(config),
        AuthAction::Logout { session } => {
            let removed = logout(config, &session)?;
            println!("Logged out session {session} ({removed} paired device(s) removed)");
            Ok(())
        },
    }
}

fn status(config: HublinkConfig) -> Result<()> {
    let state = AppState::open(config)?;
    let sessions = state.registry.saved_sessions();
    if sessions.is_empty() {
        println!("No saved sessions.");
        return Ok(());
    }
    for (id, session) in sessions {
        let token = &session.token;
        let health = if token.access_token().is_none() {
            "no access token"
        } else if token.is_refreshable() {
            "authorized"
        } else {
            "authorized (no refresh token)"
        };
        println!(
            "{id} [{}] {} ({health})",
            session.config_id,
            session
                .title
                .as_deref()
                .or(token.external_identity())
                .unwrap_or("untitled"),
        );
    }
    Ok(())
}

/// Destroy the session and drop its paired devices. Returns how many devices
/// were removed.
fn logout(config: HublinkConfig, session_id: &str) -> Result<usize> {
    let state = AppState::open(config)?;
    let Some(saved) = state.registry.saved_sessions().remove(session_id) else {
        bail!("no saved session {session_id}");
    };
    state.registry.restore();
    state
        .registry
        .destroy_client(session_id, &saved.config_id)?;
    Ok(state.forget_session_devices(session_id)?)
}
