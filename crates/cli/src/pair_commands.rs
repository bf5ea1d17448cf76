use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use {
    anyhow::{Context, Result, anyhow, bail},
    clap::Args,
    hublink_config::HublinkConfig,
    hublink_gateway::{AppState, PairableDevice, PairingError, PairingEvent, PairingSession, PairingStep},
};

#[derive(Args)]
pub struct PairArgs {
    /// Vendor region id (e.g. "europe", "china").
    #[arg(long, required_unless_present = "repair")]
    region: Option<String>,

    /// Log in again for a saved session and reinitialize its devices.
    #[arg(long, value_name = "SESSION", conflicts_with_all = ["region", "all"])]
    repair: Option<String>,

    /// Driver to pair devices into.
    #[arg(long, default_value = "motion")]
    driver: String,

    #[arg(long, env = "HUBLINK_USERNAME", conflicts_with = "oauth")]
    username: Option<String>,

    #[arg(long, env = "HUBLINK_PASSWORD", conflicts_with = "oauth", hide_env_values = true)]
    password: Option<String>,

    /// Log in through the browser instead of with a password.
    #[arg(long)]
    oauth: bool,

    /// Add every listed device without asking.
    #[arg(long)]
    all: bool,
}

fn user_error(e: PairingError) -> anyhow::Error {
    anyhow!(e.user_message())
}

pub async fn handle_pair(config: HublinkConfig, args: PairArgs) -> Result<()> {
    let state = AppState::open(config)?;
    state.registry.restore();
    state.install_config_drivers().await;
    let driver = state
        .driver(&args.driver)
        .await
        .ok_or_else(|| anyhow!("unknown driver: {}", args.driver))?;

    let mut pairing = PairingSession::new(Arc::clone(&state), driver);
    let start = match (&args.repair, &args.region) {
        (Some(session_id), _) => PairingEvent::Repair {
            session_id: session_id.clone(),
        },
        (None, Some(region)) => PairingEvent::SelectRegion {
            config_id: region.clone(),
        },
        (None, None) => bail!("either --region or --repair is required"),
    };
    pairing.handle(start).await.map_err(user_error)?;
    if pairing.is_reusing_session() && !pairing.is_repairing() {
        println!(
            "Using the saved session for {}.",
            pairing.config_id().unwrap_or_default()
        );
    }

    let choice = if args.oauth {
        PairingEvent::ChooseOAuth2
    } else {
        PairingEvent::ChooseCredentials
    };
    let step = pairing.handle(choice).await.map_err(user_error)?;
    let login = match step {
        PairingStep::LoginOAuth2 => Some(oauth_login(&pairing)?),
        PairingStep::LoginCredentials => Some(PairingEvent::Login {
            username: match args.username {
                Some(username) => username,
                None => prompt("Username: ")?,
            },
            password: match args.password {
                Some(password) => password,
                None => prompt("Password: ")?,
            },
        }),
        _ => None,
    };
    if let Some(login) = login {
        pairing.handle(login).await.map_err(user_error)?;
    }
    if pairing.step() == PairingStep::Done {
        println!(
            "Session {} re-authorized, {} device(s) reinitialized.",
            args.repair.as_deref().unwrap_or_default(),
            pairing.reinitialized()
        );
        return Ok(());
    }

    if let Err(e) = pairing.handle(PairingEvent::ListDevices).await {
        if let Some(client) = pairing.client().filter(|_| pairing.is_reusing_session()) {
            bail!(
                "{}\nIf the saved login has expired, run `hublink pair --repair {}`.",
                e.user_message(),
                client.session_id()
            );
        }
        return Err(user_error(e));
    }
    let listed = pairing.listed().to_vec();
    if listed.is_empty() {
        println!("No pairable devices found on this account.");
        return Ok(());
    }
    for (index, device) in listed.iter().enumerate() {
        println!("{:>3}. {} ({}, {})", index + 1, device.name, device.id, device.model);
    }

    let devices = if args.all {
        listed
    } else {
        let answer = prompt("Devices to add (e.g. 1,3; empty for all): ")?;
        select(&listed, &answer)?
    };
    let count = devices.len();
    pairing
        .handle(PairingEvent::AddDevices { devices })
        .await
        .map_err(user_error)?;

    let session_id = pairing
        .client()
        .map(|c| c.session_id().to_string())
        .unwrap_or_default();
    println!("Paired {count} device(s) under session {session_id}.");
    Ok(())
}

fn oauth_login(pairing: &PairingSession) -> Result<PairingEvent> {
    let url = pairing
        .authorization_url()
        .context("no authorization url for this region")?;
    println!("Opening browser for authorization...");
    if open::that(url).is_err() {
        println!("Could not open browser. Please visit:\n{url}");
    }
    let code = prompt("Paste the authorization code: ")?;
    Ok(PairingEvent::AuthorizationCode { code })
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Pick devices by 1-based, comma separated positions. Empty input picks
/// every device.
fn select(listed: &[PairableDevice], answer: &str) -> Result<Vec<PairableDevice>> {
    if answer.trim().is_empty() {
        return Ok(listed.to_vec());
    }
    let mut picked: Vec<PairableDevice> = Vec::new();
    for part in answer.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let position: usize = part
            .parse()
            .with_context(|| format!("not a device number: {part}"))?;
        let Some(device) = position.checked_sub(1).and_then(|i| listed.get(i)) else {
            bail!("no device number {position}");
        };
        if !picked.contains(device) {
            picked.push(device.clone());
        }
    }
    Ok(picked)
}
