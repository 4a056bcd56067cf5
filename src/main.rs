use bmtl_fleet::config::AppConfig;
use bmtl_fleet::mqtt::config::BrokerConfig;
use bmtl_fleet::mqtt::mqtt_handler::{MqttHandle, SessionBuilder};
use bmtl_fleet::mqtt::session::{pretty_payload, ConnectionState, SessionSnapshot};
use bmtl_fleet::mqtt::topics::Target;
use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bmtl-fleet", about = "Monitor and command a BMTL camera fleet over MQTT")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct BrokerArgs {
    /// Broker host, `ws://host[/path]` or `mqtt://host`. Omit to resume the saved session.
    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value_t = 1883)]
    port: u16,

    #[arg(long, default_value = "")]
    username: String,

    #[arg(long, default_value = "")]
    password: String,
}

impl BrokerArgs {
    fn broker(&self) -> Option<BrokerConfig> {
        self.host.as_ref().map(|host| {
            BrokerConfig::new(host.clone(), self.port)
                .with_credentials(self.username.clone(), self.password.clone())
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and follow device state until Ctrl-C
    Monitor {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Extra topic filters on top of the default subscriptions
        #[arg(long = "subscribe")]
        topics: Vec<String>,
    },
    /// Send one command to a device (`3`) or the fleet (`all`)
    Send {
        #[command(flatten)]
        broker: BrokerArgs,

        target: String,

        command: String,

        /// JSON object payload, camelCase keys
        #[arg(long)]
        data: Option<String>,
    },
    /// Drop the saved connection so the next start does not resume it
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let config = AppConfig::load(cli.config.as_deref()).await?;
    debug!("Effective config: {:?}", config);

    match cli.command {
        Commands::Monitor { broker, topics } => monitor(config, broker, topics).await,
        Commands::Send {
            broker,
            target,
            command,
            data,
        } => send(config, broker, target, command, data).await,
        Commands::Forget => {
            let store = config.session_store();
            store.clear().await?;
            info!("Saved session removed from {}", store.dir().display());
            Ok(())
        }
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn start(handle: &MqttHandle, broker: &BrokerArgs) -> Result<()> {
    match broker.broker() {
        Some(config) => handle.connect(config).await?,
        None => {
            if !handle.resume().await? {
                return Err(eyre!("No saved session to resume, pass --host"));
            }
        }
    }
    Ok(())
}

async fn wait_ready(handle: &MqttHandle, limit: Duration) -> Result<()> {
    let mut rx = handle.watch();
    let snapshot = tokio::time::timeout(
        limit,
        rx.wait_for(|s| s.ready || s.status.connection_state == ConnectionState::Error),
    )
    .await
    .map_err(|_| eyre!("Broker did not answer within {:?}", limit))?
    .map_err(|e| eyre!("Session stopped: {}", e))?
    .clone();

    if snapshot.status.connection_state == ConnectionState::Error {
        return Err(eyre!("{}", snapshot.status.status_text));
    }
    Ok(())
}

fn traffic(snapshot: &SessionSnapshot) -> usize {
    snapshot.status.messages_received + snapshot.status.messages_sent
}

fn print_devices(snapshot: &SessionSnapshot) {
    for (id, device) in &snapshot.devices {
        info!(
            "[{:02}] {} site={} battery={} temp={} power={} last={}",
            id,
            if device.is_online() { "online " } else { "offline" },
            device.site_name.as_deref().unwrap_or("-"),
            device.battery_level.map(|v| format!("{:.0}%", v)).unwrap_or_else(|| "-".into()),
            device.temperature.map(|v| format!("{:.1}C", v)).unwrap_or_else(|| "-".into()),
            device.camera_power_status,
            device.last_capture_time.as_deref().unwrap_or("-"),
        );
    }
}

async fn monitor(config: AppConfig, broker: BrokerArgs, topics: Vec<String>) -> Result<()> {
    let (handle, task) = SessionBuilder::new(config).spawn();
    let mut notifications = handle.notifications();
    start(&handle, &broker).await?;
    wait_ready(&handle, Duration::from_secs(30)).await?;

    for topic in topics {
        let ack = handle.subscribe(topic.clone()).await;
        info!("Subscribe {}: {:?}", topic, ack);
    }

    let mut rx = handle.watch();
    let mut last_state = rx.borrow().status.connection_state;
    let mut seen = traffic(&rx.borrow());
    let mut revision = rx.borrow().registry_revision;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving the session resumable");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    warn!("Session task ended");
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if snapshot.status.connection_state != last_state {
                    last_state = snapshot.status.connection_state;
                    info!("{}", snapshot.status.status_text);
                }
                if traffic(&snapshot) != seen {
                    seen = traffic(&snapshot);
                    if let Some(message) = snapshot.messages.last() {
                        debug!("{} {} {}", message.kind, message.topic, pretty_payload(&message.payload));
                    }
                }
                if snapshot.registry_revision != revision {
                    revision = snapshot.registry_revision;
                    print_devices(&snapshot);
                }
            }
            notification = notifications.recv() => match notification {
                Ok(notification) if notification.success => info!("{}", notification),
                Ok(notification) => warn!("{}", notification),
                Err(e) => debug!("Notification stream: {}", e),
            }
        }
    }

    task.abort();
    Ok(())
}

async fn send(
    config: AppConfig,
    broker: BrokerArgs,
    target: String,
    command: String,
    data: Option<String>,
) -> Result<()> {
    let target: Target = target.parse()?;
    let data: Value = match data {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| eyre!("--data is not JSON: {}", e))?,
        None => Value::Null,
    };

    let (handle, task) = SessionBuilder::new(config).spawn();
    start(&handle, &broker).await?;
    wait_ready(&handle, Duration::from_secs(30)).await?;

    let ack = handle.send_command(target, &command, data).await;
    task.abort();

    if ack.is_confirmed() {
        info!("{} delivered to {}", command, target);
        Ok(())
    } else {
        Err(eyre!("{} for {} not delivered: {:?}", command, target, ack))
    }
}
