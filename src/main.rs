//! mqclient command-line tool
//!
//! Runs against an embedded in-process queue manager built from the
//! `[embedded]` section of the configuration. Exit status is 0 on success and
//! otherwise derived from the failing reason code.

use clap::{Parser, Subcommand};
use mqclient::admin::{AdminEngine, AttrValue, AttributeSet, CommandCode};
use mqclient::config::{ClientConfig, ConfigError};
use mqclient::observability;
use mqclient::transport::BrokerPtr;
use mqclient::{
    connect, Connection, GetOptions, MemoryBroker, Message, MqError, OpenMode, PutOptions,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mqclient")]
#[command(about = "Message-queuing client against an embedded queue manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQCLIENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
    /// Put messages to a queue and read them back
    Smoke {
        #[arg(long, default_value = "MQCLIENT.SMOKE")]
        queue: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Send the puts asynchronously
        #[arg(long)]
        asynchronous: bool,
    },
    /// Run an admin command, e.g. `admin create-queue -a Q_NAME=APP.IN`
    Admin {
        command: String,
        /// Attributes as NAME=VALUE; comma separated values become lists
        #[arg(short, long = "attr", value_name = "NAME=VALUE")]
        attributes: Vec<String>,
    },
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Client(MqError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Client(err) => err.exit_code(),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "configuration error: {e}"),
            CliError::Client(e) => write!(f, "{e} (reason {})", e.reason_code()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<MqError> for CliError {
    fn from(e: MqError) -> Self {
        CliError::Client(e)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match load_configuration(&cli.config) {
        Ok((config, source)) => {
            observability::init(&config.logging.clone().with_env_overrides());
            info!("Configuration loaded from {}", source);
            run(cli.command, config).await
        }
        Err(e) => {
            observability::init_from_env();
            Err(e.into())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("{e}");
        process::exit(e.exit_code());
    }
}

/// Load the configuration and say where it came from; runs before logging is set up
fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<(ClientConfig, String), ConfigError> {
    if let Some(path) = config_path {
        return Ok((ClientConfig::load_from_file(path)?, path.display().to_string()));
    }
    for path_str in ["mqclient.toml", "config/mqclient.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            return Ok((ClientConfig::load_from_file(&path)?, path_str.to_string()));
        }
    }
    let config = ClientConfig::from_toml("[connection]\nendpoint = \"memory://QM1\"\n")?;
    Ok((config, "built-in defaults (embedded QM1)".to_string()))
}

async fn run(command: Commands, config: ClientConfig) -> Result<(), CliError> {
    match command {
        Commands::Config { show } => {
            if show {
                let rendered = toml::to_string_pretty(&config)
                    .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
                println!("{rendered}");
            }
            config.to_connect_options()?;
            info!("Configuration validation complete");
            Ok(())
        }
        Commands::Smoke {
            queue,
            count,
            asynchronous,
        } => {
            let connection = start(&config, Some(&queue)).await?;
            let outcome = tokio::select! {
                outcome = smoke(&connection, &queue, count, asynchronous) => outcome,
                _ = signal::ctrl_c() => {
                    info!("Received interrupt, shutting down");
                    Ok(())
                }
            };
            finish(connection, outcome).await
        }
        Commands::Admin {
            command,
            attributes,
        } => {
            let command: CommandCode = command.parse()?;
            let attributes = parse_attributes(&attributes)?;
            let connection = start(&config, None).await?;
            let admin = AdminEngine::with_options(connection.clone(), config.admin_options());
            let outcome = admin.execute(command, attributes).await.map(|result| {
                match result.failure() {
                    Some(failure) => println!("{command} failed: {failure}"),
                    None => {
                        for set in result.attributes() {
                            match serde_json::to_string(set) {
                                Ok(line) => println!("{line}"),
                                Err(e) => warn!("unprintable reply: {}", e),
                            }
                        }
                    }
                }
            });
            finish(connection, outcome).await
        }
    }
}

/// Start the embedded queue manager and connect to it
async fn start(config: &ClientConfig, smoke_queue: Option<&str>) -> Result<Connection, CliError> {
    let memory = MemoryBroker::new(&config.embedded_queue_manager()?);
    if let Some(embedded) = &config.embedded {
        for queue in &embedded.queues {
            memory.define_queue(queue.definition());
        }
    }
    if let Some(name) = smoke_queue.filter(|name| !memory.queue_exists(name)) {
        memory.define_queue(mqclient::transport::memory::QueueDefinition::local(name));
    }

    let broker: BrokerPtr = Arc::new(memory);
    let connection = connect(broker, config.to_connect_options()?).await?;
    info!(
        connection = connection.id(),
        queue_manager = ?connection.queue_manager(),
        "connected"
    );
    Ok(connection)
}

async fn finish(connection: Connection, outcome: Result<(), MqError>) -> Result<(), CliError> {
    let closed = connection.disconnect().await;
    outcome?;
    closed?;
    Ok(())
}

async fn smoke(
    connection: &Connection,
    queue: &str,
    count: usize,
    asynchronous: bool,
) -> Result<(), MqError> {
    let out = connection.open_queue(queue, OpenMode::Output).await?;
    let input = connection.open_queue(queue, OpenMode::Input).await?;

    let options = if asynchronous {
        PutOptions::new().asynchronous()
    } else {
        PutOptions::new()
    };
    for i in 0..count {
        out.put(Message::text(format!("smoke message {i}")), options)
            .await?;
    }
    if asynchronous {
        let status = connection.drain_async_status().await;
        println!(
            "async puts: {} succeeded, {} warned, {} failed",
            status.succeeded, status.warned, status.failed
        );
        if let Some(err) = status.first_error {
            return Err(err);
        }
    }

    let mut received = 0;
    loop {
        match input.get(GetOptions::no_wait()).await {
            Ok(_) => received += 1,
            Err(e) if e.is_no_message() => break,
            Err(e) => return Err(e),
        }
    }
    println!("put {count}, received {received} on {queue}");
    Ok(())
}

fn parse_attributes(raw: &[String]) -> Result<AttributeSet, MqError> {
    let mut attributes = AttributeSet::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| MqError::invalid_argument(format!("expected NAME=VALUE, got '{entry}'")))?;
        let value = if let Ok(int) = value.parse::<i64>() {
            AttrValue::Int(int)
        } else if value.contains(',') {
            AttrValue::StrList(value.split(',').map(str::to_string).collect())
        } else {
            AttrValue::Str(value.to_string())
        };
        attributes.insert(name.trim().to_ascii_uppercase(), value);
    }
    Ok(attributes)
}
