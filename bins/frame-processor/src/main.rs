use clap::Parser;
use serde_json::Value;

use aperture_engine::controller::ProcessorController;
use aperture_engine::error::EngineError;

#[derive(Parser)]
#[command(name = "frame-processor", about = "Detector frame processor daemon")]
struct Cli {
    /// Control channel bind endpoint.
    #[arg(long, default_value = "tcp://0.0.0.0:5004")]
    ctrl: String,

    /// Channel I/O worker thread count.
    #[arg(long, default_value_t = 2)]
    io_threads: usize,

    /// JSON configuration file: one configure-params object, or an array
    /// of them applied in order at startup.
    #[arg(long, env = "APERTURE_FP_CONFIG")]
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

fn load_startup(path: &str) -> Result<Vec<Value>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    let value: Value = serde_json::from_str(&content).map_err(|e| format!("{path}: {e}"))?;
    match value {
        Value::Array(entries) => {
            if entries.iter().any(|e| !e.is_object()) {
                return Err(format!("{path}: every entry must be an object"));
            }
            Ok(entries)
        }
        Value::Object(_) => Ok(vec![value]),
        _ => Err(format!("{path}: expected an object or an array of objects")),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug_level, cli.log_config.as_deref());

    let startup = match &cli.config {
        Some(path) => match load_startup(path) {
            Ok(startup) => startup,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Vec::new(),
    };

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
        let controller = match ProcessorController::bind(&cli.ctrl).await {
            Ok(controller) => controller,
            Err(e) => {
                tracing::error!(error = %e, "failed to bind control endpoint");
                return 2;
            }
        };

        let shutdown = controller.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
                shutdown.request_shutdown();
            }
        });

        match controller.run(startup).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "frame processor failed");
                exit_code(&e)
            }
        }
    });
    std::process::exit(code);
}

fn exit_code(error: &EngineError) -> i32 {
    match error {
        EngineError::Channel(aperture_common::error::ChannelError::Bind { .. }) => 2,
        _ => 1,
    }
}
