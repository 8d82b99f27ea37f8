use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::{Parser, ValueEnum};
use color_eyre::{Result, eyre::Context};
use gantry::{
    adapters::{HttpHandler, HttpTransport, register_builtin_middlewares},
    config::{GatewayConfig, GatewayConfigValidator, loader::load_config},
    core::{GatewayHooks, GatewayService, Pipeline},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Override the log format from the configuration file
    #[clap(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.log_format).await,
        None => serve(&args.config, args.log_format).await,
    }
}

async fn serve(config_path: &str, log_format: Option<LogFormat>) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    let json_logs = match log_format {
        Some(LogFormat::Json) => true,
        Some(LogFormat::Pretty) => false,
        None => config.logging.json,
    };
    tracing_setup::init_tracing_with_config(&config.logging.level, json_logs)
        .context("Failed to initialize tracing")?;

    tracing::info!("Loaded configuration from {config_path}");
    GatewayConfigValidator::validate(&config).context("Invalid configuration")?;

    let transport = Arc::new(HttpTransport::new()?);
    let hooks = GatewayHooks::new()
        .on_upstream_unhealthy(|upstream, error| {
            tracing::warn!("Upstream {} marked unhealthy: {}", upstream.name, error);
        })
        .on_upstream_recovered(|upstream| {
            tracing::info!("Upstream {} recovered", upstream.name);
        });
    let gateway = GatewayService::from_config(&config, transport, hooks).await?;

    let pipeline = Pipeline::new();
    register_builtin_middlewares(&pipeline, &config.middleware)
        .context("Failed to register built-in middlewares")?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let graceful_shutdown = GracefulShutdown::new();
    let signal_handler = {
        let graceful_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = graceful_shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
                graceful_shutdown.trigger_shutdown(ShutdownReason::Force);
            }
        })
    };

    gateway.start();

    let app = HttpHandler::new(gateway.clone(), Arc::new(pipeline)).router();
    tracing::info!(
        "Gantry gateway starting on {} with {} upstreams",
        addr,
        gateway.upstream_count()
    );

    let shutdown_signal = graceful_shutdown.shutdown_signal();
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = shutdown_signal.await;
            tracing::info!("Shutdown signal received: {:?}", reason);
        })
        .await
        .context("Server error");

    tracing::info!("Stopping health prober...");
    if graceful_shutdown.drain(gateway.stop()).await.is_none() {
        tracing::warn!("Health prober did not stop in time");
    }
    signal_handler.abort();

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            print_summary(&config);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure every endpoint starts with http:// or https://");
            println!("   • Give every upstream a unique, non-empty name");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Check middleware scope patterns ('/exact', '/prefix/**', '/dir/*')");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &GatewayConfig) {
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Load Balancing: {:?}", config.load_balancing);
    println!(
        "   • Health Checks: {} (every {}ms)",
        config.health_check, config.health_check_interval_ms
    );
    println!(
        "   • Circuit Breaker: {} failures / {}ms window, reset after {}ms",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.failure_window_ms,
        config.circuit_breaker.reset_timeout_ms
    );
    println!("   • Upstreams: {}", config.upstreams.len());
    for upstream in &config.upstreams {
        println!(
            "     - {} -> {} (tool prefix: {})",
            upstream.name,
            upstream.endpoint,
            upstream.tool_prefix.as_deref().unwrap_or("-")
        );
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Gantry gateway configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

# round_robin | random | least_connections | weighted
load_balancing = "round_robin"

# Periodic liveness probes (GET endpoint + health_path)
health_check = true
health_check_interval_ms = 30000

# Default bound for calls and probes, per upstream overridable
timeout_ms = 30000

[circuit_breaker]
failure_threshold = 5
reset_timeout_ms = 30000
failure_window_ms = 60000

[middleware]
request_id = true
timing = true
# request_timeout_ms = 10000

# [middleware.custom_headers]
# headers = { "x-served-by" = "gantry" }
# scope = { paths = ["/mcp/**"] }

[logging]
level = "info"
json = true

# Calls named "weather_*" go to this upstream with the prefix stripped
[[upstreams]]
name = "weather"
endpoint = "http://localhost:9001"
tool_prefix = "weather_"

[[upstreams]]
name = "news"
endpoint = "http://localhost:9002"
tool_prefix = "news_"
weight = 2
# retries = 1
# headers = { authorization = "Bearer change-me" }
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'gantry serve --config {config_path}' to start the server");
    Ok(())
}
