use blowcontrol::commands::{
    self, oscillation, parse_boolean, parse_sleep_time, parse_width, snap_width, OscillationPlan,
};
use blowcontrol::config::AppConfig;
use blowcontrol::mqtt::message_manager::{CommandFields, MessageKind};
use blowcontrol::session::{DeviceSession, ListenerSettings, Predicate};
use blowcontrol::SessionError;
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "blowcontrol", version, about = "Control a fan appliance over MQTT")]
struct Cli {
    /// Settings file, defaults to ~/.config/blowcontrol/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Wait up to SECS for the appliance to confirm a command
    #[arg(long, global = true, value_name = "SECS")]
    wait: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch current state and sensor readings
    State {
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Print the merged state on every update
    Listen {
        /// Stop after SECS, otherwise run until Ctrl-C
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },
    Power {
        #[arg(value_parser = parse_boolean, action = ArgAction::Set)]
        on: bool,
    },
    /// Fan speed 1-10, 0 turns the fan off
    Speed { speed: u32 },
    Auto {
        #[arg(value_parser = parse_boolean, action = ArgAction::Set)]
        on: bool,
    },
    Night {
        #[arg(value_parser = parse_boolean, action = ArgAction::Set)]
        on: bool,
    },
    /// Sleep timer: off, minutes, H:MM or 2h15m
    Timer {
        #[arg(value_parser = parse_sleep_time)]
        minutes: u32,
    },
    /// Sweep width (off, narrow, medium, wide, full or degrees)
    Oscillate {
        width: String,
        /// Centre of the sweep, defaults to the fan's current position
        #[arg(long)]
        heading: Option<u32>,
    },
    StopOscillation,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let config = AppConfig::load(cli.config.as_deref()).await?;
    let connection = config.connection_config()?;

    info!("Connecting to device {}", connection.serial_number);
    let session = tokio::task::spawn_blocking(move || DeviceSession::connect(connection))
        .await
        .map_err(|e| eyre!("Connect task failed: {}", e))??;

    let result = run(&cli, &config, &session).await;

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.disconnect())
        .await
        .map_err(|e| eyre!("Disconnect task failed: {}", e))?;

    result
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(verbose);
    Ok(())
}

fn setup_logging_env(verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(Level::WARN)
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

async fn run(cli: &Cli, config: &AppConfig, session: &DeviceSession) -> Result<()> {
    let outcome = match &cli.command {
        Command::State { timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.request_timeout());
            let report = session.request_state_async(timeout).await?;
            if report.partial {
                warn!("Device answered only partially within {:?}", timeout);
            }
            return print_json(&report);
        }
        Command::Listen { duration } => {
            return listen(config, session, duration.map(Duration::from_secs)).await;
        }
        Command::Power { on } => send(session, commands::power(*on), cli.wait).await?,
        Command::Speed { speed } => send(session, commands::fan_speed(*speed)?, cli.wait).await?,
        Command::Auto { on } => send(session, commands::auto_mode(*on), cli.wait).await?,
        Command::Night { on } => send(session, commands::night_mode(*on), cli.wait).await?,
        Command::Timer { minutes } => {
            send(session, commands::sleep_timer(*minutes)?, cli.wait).await?
        }
        Command::Oscillate { width, heading } => {
            let width = snap_width(parse_width(width)?);
            if width == 0 && heading.is_none() {
                send(session, commands::stop_oscillation(), cli.wait).await?
            } else {
                let heading = match heading {
                    Some(heading) => *heading,
                    None => current_heading(config, session).await,
                };
                let plan = OscillationPlan::new(width, heading)?;
                let mut outcome = send(session, plan.fields(), cli.wait).await?;
                outcome.oscillation = Some(plan);
                outcome
            }
        }
        Command::StopOscillation => send(session, commands::stop_oscillation(), cli.wait).await?,
    };

    print_json(&outcome)
}

async fn listen(
    config: &AppConfig,
    session: &DeviceSession,
    duration: Option<Duration>,
) -> Result<()> {
    let settings = ListenerSettings {
        refresh_interval: config.refresh_interval(),
    };
    let listener = session.listener(settings).start()?;
    let mut updates = listener.updates();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Could not listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                print_json(&listener.snapshot())?;
            }
        }
    }

    let stopped = listener.stop().await;
    debug!(
        "Listener stopped at revision {}",
        stopped.session().state().revision()
    );
    Ok(())
}

async fn current_heading(config: &AppConfig, session: &DeviceSession) -> u32 {
    if !session.current_snapshot().has_full_state {
        if let Err(e) = session.request_state_async(config.request_timeout()).await {
            warn!("Could not read fan position: {}", e);
        }
    }
    oscillation::current_heading(&session.current_snapshot())
}

#[derive(Serialize)]
struct CommandOutcome {
    sent: CommandFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oscillation: Option<OscillationPlan>,
}

async fn send(
    session: &DeviceSession,
    fields: CommandFields,
    wait: Option<u64>,
) -> Result<CommandOutcome> {
    let Some(secs) = wait else {
        session.publish_command(&fields)?;
        return Ok(CommandOutcome {
            sent: fields,
            confirmed: None,
            state: None,
            oscillation: None,
        });
    };

    let waiting = session.clone();
    let sent = fields.clone();
    let delivery = tokio::task::spawn_blocking(move || {
        waiting.publish_and_wait(
            &sent,
            Predicate::kind(MessageKind::StateChange),
            Duration::from_secs(secs),
        )
    })
    .await
    .map_err(|e| eyre!("Command task failed: {}", e))?;

    let confirmed = match delivery {
        Ok(delivery) => delivery.complete,
        Err(SessionError::Timeout(timeout)) => {
            warn!("No state change within {:?}", timeout);
            false
        }
        Err(e) => return Err(e.into()),
    };

    Ok(CommandOutcome {
        sent: fields,
        confirmed: Some(confirmed),
        state: Some(json!(session.current_snapshot().product_state)),
        oscillation: None,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
