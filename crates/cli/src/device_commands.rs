use {anyhow::Result, clap::Subcommand, hublink_config::HublinkConfig, hublink_gateway::AppState};

#[derive(Subcommand)]
pub enum DeviceAction {
    /// List paired devices and the session each belongs to.
    List,
}

pub fn handle_devices(config: HublinkConfig, action: DeviceAction) -> Result<()> {
    match action {
        DeviceAction::List => list(config),
    }
}

fn list(config: HublinkConfig) -> Result<()> {
    let state = AppState::open(config)?;
    let devices = state.paired_devices();
    if devices.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }
    let sessions = state.registry.saved_sessions();
    for paired in devices {
        let account = sessions
            .get(&paired.session_id)
            .and_then(|s| s.title.clone())
            .unwrap_or_else(|| "missing session".into());
        println!(
            "{} \"{}\" {} driver={} region={} account={account}",
            paired.device.id,
            paired.device.name,
            paired.device.model,
            paired.driver_id,
            paired.config_id,
        );
    }
    Ok(())
}
