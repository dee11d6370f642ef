/*!
 * Warden CLI
 *
 * Inspect the device profile, validate configuration files and run a
 * scripted failure scenario against an in-process resilience context.
 */

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use warden::{
    config::{LogLevel, WardenConfig},
    context::{ErrorEvent, ResilienceContext},
    logging,
    policy::{InMemoryHooks, ResourceDescriptor, ViolationEvent},
    probe::DeviceProbe,
    resilience::{HealthSource, Priority},
    store::MemoryBackend,
    WardenError,
};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Client-side resource governance and self-healing", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", value_enum, default_value = "warn", global = true)]
    log_level: LogLevelArg,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (same as --log-level debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective values
    Check,

    /// Probe the device and print the derived admission limits
    Probe,

    /// Write the default configuration to a file
    Init {
        /// Output path
        #[arg(short = 'o', long = "output", default_value = "warden.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Drive a scripted failure scenario and print the resulting health
    Simulate {
        /// Flood rounds; the orchestrator is polled after each
        #[arg(long, default_value = "3")]
        ticks: u32,

        /// Signals sent per round
        #[arg(long, default_value = "25")]
        signals: u32,

        /// Storage errors reported while the backend is failing
        #[arg(long, default_value = "5")]
        storage_errors: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<WardenError>() {
                Some(WardenError::Config(_)) => 2,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => WardenConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WardenConfig::default(),
    };

    config.logging.level = cli.log_level.into();
    config.logging.file = cli.log.clone();
    config.logging.verbose = cli.verbose;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Commands::Check => {
            config.validate()?;
            println!("Configuration OK");
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Probe => {
            let profile = DeviceProbe::scan();
            let limits = config.admission.to_admission_config(profile.class);
            let report = serde_json::json!({
                "profile": profile,
                "admission": {
                    "max_concurrent_leases": limits.max_concurrent_leases,
                    "max_queue_size": limits.max_queue_size,
                    "queue_timeout_ms": limits.queue_timeout.as_millis() as u64,
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
            }
            WardenConfig::default().to_file(&output)?;
            println!("Wrote default configuration to {}", output.display());
            Ok(())
        }
        Commands::Simulate {
            ticks,
            signals,
            storage_errors,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(simulate(config, ticks, signals, storage_errors))
        }
    }
}

async fn simulate(
    config: WardenConfig,
    ticks: u32,
    signals: u32,
    storage_errors: u32,
) -> anyhow::Result<()> {
    let window = Duration::from_millis(config.governor.window_ms);
    let backend = MemoryBackend::new();
    let hooks = Arc::new(InMemoryHooks::new());
    let loader = |resource: &ResourceDescriptor| -> warden::Result<()> {
        if resource.url.contains("blocked") {
            Err(WardenError::Load {
                url: resource.url.clone(),
                reason: "refused by host".to_string(),
            })
        } else {
            Ok(())
        }
    };

    let context = ResilienceContext::builder(config)
        .profile(DeviceProbe::scan())
        .backend(Arc::new(backend.clone()))
        .loader(Arc::new(loader))
        .hooks(hooks.clone())
        .build()?;

    // Signal flood, one window per round
    let mut delivered = 0u32;
    let mut rounds = Vec::new();
    for tick in 0..ticks {
        for n in 0..signals {
            if context.governor().process_signal(n, |n| n).is_ok() {
                delivered += 1;
            }
        }
        let snapshot = context.orchestrator().poll().await;
        rounds.push(serde_json::json!({
            "tick": tick,
            "overall": snapshot.overall.as_str(),
            "governor": context.governor().health().detail,
        }));
        tokio::time::sleep(window).await;
    }

    // Storage blocked by the host
    backend.set_failing(true);
    context
        .store()
        .set("session", r#"{"user":"demo"}"#, None)
        .await;
    let mut storage_outcomes = Vec::new();
    for n in 0..storage_errors {
        if n + 1 == storage_errors {
            backend.set_failing(false);
        }
        let outcome = context
            .on_error(ErrorEvent::new("QuotaExceededError: storage is full"))
            .await;
        storage_outcomes.push(format!("{:?}", outcome));
    }

    // Content policy blocks an analytics script
    context
        .policy()
        .register_fallback("https://cdn.example/blocked/lib.js", "/vendor/lib.js");
    let fallback = context
        .on_violation(ViolationEvent::new(
            "https://cdn.example/blocked/lib.js",
            "script-src",
        ))
        .await;
    let stubbed = context
        .on_violation(ViolationEvent::new(
            "https://www.googletagmanager.com/gtag/js",
            "script-src",
        ))
        .await;

    // Rendering surfaces past capacity
    let capacity = context.admission().config().max_concurrent_leases;
    for n in 0..capacity {
        context
            .request_surface(format!("chart-{n}"), format!("chart-{n}"), Priority::Low)
            .await;
    }
    let hero = context
        .request_surface("hero", "hero", Priority::Critical)
        .await;

    // Preloads, one of which is never used
    context
        .assets()
        .register_preload("/img/hero.webp", 48_000, Duration::from_millis(30));
    context
        .assets()
        .register_preload("/fonts/unused.woff2", 22_000, Duration::from_millis(12));
    context.assets().mark_used("/img/hero.webp");

    let snapshot = context.orchestrator().poll().await;

    let report = serde_json::json!({
        "profile": context.profile(),
        "signals": {
            "sent": signals * ticks,
            "delivered": delivered,
            "rounds": rounds,
        },
        "storage": {
            "outcomes": storage_outcomes,
            "status": context.store().status(),
        },
        "policy": {
            "fallback": format!("{:?}", fallback),
            "stub": format!("{:?}", stubbed),
            "stubbed_hooks": hooks.installed(),
            "stats": context.policy().stats(),
        },
        "surfaces": {
            "critical": format!("{:?}", hero),
            "stats": context.admission().stats(),
        },
        "assets": context.assets().metrics(),
        "recovery": context.escalator().stats(),
        "governor": context.governor().health(),
        "health": snapshot,
        "optimized": context.orchestrator().optimized_config(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
