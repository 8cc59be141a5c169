use clap::Parser;

use aperture_receiver::config::ReceiverConfig;
use aperture_receiver::controller::ReceiverController;
use aperture_receiver::error::ReceiverError;

#[derive(Parser)]
#[command(name = "frame-receiver", about = "Detector frame receiver daemon")]
struct Cli {
    /// Control channel bind endpoint.
    #[arg(long)]
    ctrl: Option<String>,

    /// Channel I/O worker thread count.
    #[arg(long, default_value_t = 2)]
    io_threads: usize,

    /// JSON configuration file applied at startup.
    #[arg(long, env = "APERTURE_RX_CONFIG")]
    config: Option<String>,

    /// Logging verbosity, 0 (quiet) to 3 (trace).
    #[arg(long, default_value_t = 1)]
    debug_level: u8,

    /// File of tracing filter directives overriding --debug-level.
    #[arg(long)]
    log_config: Option<String>,
}

fn init_logging(debug_level: u8, log_config: Option<&str>) {
    let filter = match log_config.and_then(|path| std::fs::read_to_string(path).ok()) {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives.trim()),
        None => {
            let level = match debug_level {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into())
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug_level, cli.log_config.as_deref());

    let mut config = match &cli.config {
        Some(path) => match ReceiverConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => ReceiverConfig::default(),
    };
    if let Some(ctrl) = &cli.ctrl {
        config.ctrl_endpoint = ctrl.clone();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.io_threads.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let mut controller = ReceiverController::new(config);
        tokio::select! {
            result = controller.run() => match result {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "frame receiver failed");
                    exit_code(&e)
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                0
            }
        }
    });
    std::process::exit(code);
}

fn exit_code(error: &ReceiverError) -> i32 {
    if error.is_bind_failure() { 2 } else { 1 }
}
