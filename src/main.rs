//! rabbitrun binary: flag parsing, wiring and the control loop.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rabbitrun::acknowledger::Acknowledger;
use rabbitrun::command;
use rabbitrun::config::{Config, ConfigError};
use rabbitrun::consumer::Consumer;
use rabbitrun::processor::ExecProcessor;
use rabbitrun::{logging, metrics};

#[derive(Debug, Parser)]
#[command(
    name = "rabbitrun",
    version,
    about = "Consume RabbitMQ easily to any cli program"
)]
struct Cli {
    /// Connect with RabbitMQ using URL
    #[arg(short, long, env = "AMQP_URL")]
    url: Option<String>,

    /// Location of executable
    #[arg(short, long)]
    executable: String,

    /// Location of configuration file
    #[arg(short, long)]
    configuration: Option<PathBuf>,

    /// Enable logging of output from executable
    #[arg(short, long)]
    output: bool,

    /// Enable verbose mode (logs to stdout and stderr)
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Pipe the message via STDIN instead of passing it as an argument. The
    /// message metadata will be passed as JSON via fd 3.
    #[arg(short, long)]
    pipe: bool,

    /// Include metadata. Passes message as JSON data including headers,
    /// properties and message body. This flag will be ignored when `--pipe`
    /// is used.
    #[arg(short, long)]
    include: bool,

    /// Strict exit code processing will rise a fatal error if exit code is
    /// different from allowed ones.
    #[arg(long)]
    strict_exit_code: bool,

    /// Optional queue name, overrides the queue name of the configuration
    /// file
    #[arg(short, long)]
    queue_name: Option<String>,

    /// Prevents the output of date and time in the logs
    #[arg(long)]
    no_datetime: bool,

    /// Prevents the queue from being declared
    #[arg(long)]
    no_declare: bool,

    /// Enables metrics to be exposed
    #[arg(short, long)]
    metrics: bool,

    /// Address on which to expose metrics and web interface
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9566")]
    web_listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    web_telemetry_path: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    ExitCode::from(run(Cli::parse()).await)
}

async fn run(cli: Cli) -> u8 {
    let mut cfg = match configuration(cli.configuration.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    apply_overrides(&mut cfg, &cli);

    if let Err(e) = logging::init(&cfg.logs) {
        eprintln!("{e}");
        return 1;
    }

    let builder = command::from_config(
        &cli.executable,
        cli.output,
        cfg.rabbitmq.compression,
        cli.include,
        cli.pipe,
    );
    let acknowledger = Acknowledger::new(cfg.rabbitmq.strict_failure, cfg.rabbitmq.on_failure);
    let processor = Arc::new(ExecProcessor::new(builder, acknowledger));

    let consumer = match Consumer::from_config(&cfg, processor).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "Failed to start consuming");
            return e.exit_code() as u8;
        }
    };

    let token = CancellationToken::new();
    spawn_sigterm_handler(token.clone());

    // The metrics server and the consume loop race into the same channel;
    // the first completion decides the exit code.
    let (done_tx, mut done_rx) = mpsc::channel::<u8>(1);

    if cli.metrics {
        info!(address = %cli.web_listen_address, "Registering metrics server");
        let done = done_tx.clone();
        let addr = cli.web_listen_address;
        let path = cli.web_telemetry_path.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, path).await {
                error!(error = %e, "Metrics server failed");
                let _ = done.send(1).await;
            }
        });
    } else {
        info!("Metrics disabled.");
    }

    tokio::spawn(async move {
        let code = match consumer.consume(token).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "Consumption ended");
                e.exit_code() as u8
            }
        };
        consumer.close().await;
        let _ = done_tx.send(code).await;
    });

    done_rx.recv().await.unwrap_or(1)
}

/// Command line flags win over the configuration file; absent flags leave
/// the file values untouched.
fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.url {
        cfg.rabbitmq.amqp_url = url.clone();
    }

    if let Some(queue) = &cli.queue_name {
        cfg.rabbitmq.queue = queue.clone();
    }

    if cli.no_datetime {
        cfg.logs.no_datetime = true;
    }

    if cli.verbose {
        cfg.logs.verbose = true;
    }

    if cli.strict_exit_code {
        cfg.rabbitmq.strict_failure = true;
    }

    if cli.no_declare {
        cfg.queuesettings.no_declare = true;
    }
}

fn configuration(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn spawn_sigterm_handler(token: CancellationToken) {
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    });
}
