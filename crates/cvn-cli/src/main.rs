// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! `studio` — the ComfyVN Studio control-plane CLI.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use cvn_config::{load_config, StudioConfig};
use cvn_error::{ErrorKind, StudioError};
use cvn_flags::{FlagStore, FlagValue};
use std::path::PathBuf;
use tracing::info;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 4;
/// Exit code when a feature flag gates the command off (usage errors exit 2
/// via clap automatically).
const EXIT_FEATURE_DISABLED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "studio", version, about = "ComfyVN Studio control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a studio.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane server.
    Serve {
        /// Bind address override.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Check the environment, configuration, and route catalog.
    Doctor,

    /// Asset registry maintenance.
    Assets {
        #[command(subcommand)]
        command: AssetsCommands,
    },

    /// Read or write feature flags.
    Flags {
        #[command(subcommand)]
        command: FlagsCommands,
    },

    /// Scheduler inspection.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Print a JSON schema to stdout.
    Schema {
        /// Which schema to print.
        #[arg(value_enum)]
        kind: SchemaKind,
    },
}

#[derive(Subcommand, Debug)]
enum AssetsCommands {
    /// Scan the asset root, re-hash files, reconcile rows and sidecars.
    Rebuild {
        /// Root to scan (defaults to the configured asset tree).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Write sidecars that are missing.
        #[arg(long)]
        enforce_sidecars: bool,
        /// Rewrite every sidecar even when current.
        #[arg(long)]
        overwrite_sidecars: bool,
        /// Coerce reserved meta keys to their expected shapes.
        #[arg(long)]
        fix_metadata: bool,
    },
}

#[derive(Subcommand, Debug)]
enum FlagsCommands {
    /// Print a flag's value.
    Get {
        /// Flag name.
        name: String,
    },
    /// Set a flag (value parsed as JSON, falling back to a string).
    Set {
        /// Flag name.
        name: String,
        /// New value: `true`, `false`, a number, or text.
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Fetch and print the scheduler board from a running server.
    Board {
        /// Server base URL.
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        server: String,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum SchemaKind {
    /// Job submission payload.
    Job,
    /// Asset record.
    Asset,
    /// Provider record.
    Provider,
    /// Hook envelope.
    Envelope,
    /// Studio configuration.
    Config,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    if let Err(e) = cvn_telemetry::init_logging(level, None) {
        eprintln!("logging setup failed: {e}");
    }

    match run(cli) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            let code = err
                .downcast_ref::<StudioError>()
                .map(|e| e.kind.exit_code())
                .unwrap_or(EXIT_RUNTIME_ERROR);
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve { bind } => serve(config, bind),
        Commands::Doctor => doctor(config),
        Commands::Assets { command } => assets(config, command),
        Commands::Flags { command } => flags(config, command),
        Commands::Schedule { command } => schedule(command),
        Commands::Schema { kind } => schema(kind),
    }
}

fn serve(mut config: StudioConfig, bind: Option<String>) -> anyhow::Result<()> {
    if let Some(b) = bind {
        config.bind = b;
    }
    config.validate()?;
    for warning in config.warnings() {
        eprintln!("warning: {warning}");
    }

    let level = config.log_level.clone().unwrap_or_else(|| "info".into());
    let server_log = config.paths().server_log;
    cvn_telemetry::init_logging(&level, Some(&server_log))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async {
        let bind = config.bind.clone();
        let state = cvn_daemon::build_state(config)?;
        let app = cvn_daemon::build_app(state);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {bind}"))?;
        info!(%bind, "studio control plane listening");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .context("serve")
    })
}

fn doctor(config: StudioConfig) -> anyhow::Result<()> {
    println!("studio doctor");
    println!("  version: {}", cvn_core::CONTRACT_VERSION);
    println!("  bind: {}", config.bind);
    println!("  root: {}", config.root.display());

    config.validate()?;
    println!("  config: ok");
    for warning in config.warnings() {
        println!("  warning: {warning}");
    }

    let paths = config.paths();
    for (label, path) in [
        ("flags", &paths.flags),
        ("jobs", &paths.jobs),
        ("assets", &paths.assets),
        ("provenance", &paths.provenance),
        ("hooks", &paths.hooks),
    ] {
        let status = if path.exists() { "present" } else { "absent" };
        println!("  {label}: {} ({status})", path.display());
    }

    let flags = FlagStore::open(&paths.flags)?;
    println!("  flags:");
    for (name, value) in flags.snapshot().iter() {
        println!("    {name} = {}", serde_json::to_string(value)?);
    }

    println!("  routes:");
    for route in cvn_daemon::route_catalog() {
        println!("    {route}");
    }
    Ok(())
}

fn assets(config: StudioConfig, command: AssetsCommands) -> anyhow::Result<()> {
    match command {
        AssetsCommands::Rebuild {
            root,
            enforce_sidecars,
            overwrite_sidecars,
            fix_metadata,
        } => {
            let paths = config.paths();
            let bus = cvn_events::EventBus::open(&paths.hooks)?;
            let registry = cvn_assets::AssetRegistry::open(&paths.provenance, bus)?;
            let root = root.unwrap_or(paths.assets);
            let summary = registry.rebuild(
                &root,
                &cvn_assets::RebuildOptions {
                    enforce_sidecars,
                    overwrite_sidecars,
                    fix_metadata,
                    metadata_report: true,
                },
            )?;
            println!(
                "scanned {} files, registered {}, rewrote {} sidecars, pruned {} rows",
                summary.scanned, summary.registered, summary.sidecars_written, summary.pruned
            );
            for issue in &summary.metadata_issues {
                println!("metadata: {issue}");
            }
            Ok(())
        }
    }
}

fn flags(config: StudioConfig, command: FlagsCommands) -> anyhow::Result<()> {
    let store = FlagStore::open(config.paths().flags)?;
    match command {
        FlagsCommands::Get { name } => {
            println!("{}", serde_json::to_string(&store.get(&name))?);
            Ok(())
        }
        FlagsCommands::Set { name, value } => {
            let parsed: FlagValue = serde_json::from_str(&value)
                .unwrap_or_else(|_| FlagValue::Text(value.clone()));
            let prev = store.set(&name, parsed.clone())?;
            println!(
                "{name}: {} (was {})",
                serde_json::to_string(&parsed)?,
                prev.map(|p| serde_json::to_string(&p).unwrap_or_default())
                    .unwrap_or_else(|| "unset".into()),
            );
            Ok(())
        }
    }
}

fn schedule(command: ScheduleCommands) -> anyhow::Result<()> {
    match command {
        ScheduleCommands::Board { server } => {
            let url = format!("{}/api/schedule/board", server.trim_end_matches('/'));
            let resp = reqwest::blocking::get(&url)
                .with_context(|| format!("fetch {url} (is the server running?)"))?;

            if !resp.status().is_success() {
                let body: cvn_error::ErrorBody = resp.json().context("decode error body")?;
                if body.error.kind == ErrorKind::FeatureDisabled {
                    eprintln!("error: {}", body.error.message);
                    std::process::exit(EXIT_FEATURE_DISABLED);
                }
                anyhow::bail!(body.error);
            }

            let board: serde_json::Value = resp.json().context("decode board")?;
            let jobs = board["jobs"].as_array().cloned().unwrap_or_default();
            println!(
                "{} jobs | local queue {} | remote queue {} | delayed {}",
                jobs.len(),
                board["queued_local"],
                board["queued_remote"],
                board["budget"]["delayed"],
            );
            for job in jobs {
                println!(
                    "  {}  {:<18} {:<9} prio {:>3}  attempts {}  worker {}",
                    job["id"].as_str().unwrap_or("?"),
                    job["spec"]["kind"].as_str().unwrap_or("?"),
                    job["state"].as_str().unwrap_or("?"),
                    job["spec"]["priority"],
                    job["attempts"],
                    job["worker_id"].as_str().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

fn schema(kind: SchemaKind) -> anyhow::Result<()> {
    let schema = match kind {
        SchemaKind::Job => schemars::schema_for!(cvn_core::JobSpec),
        SchemaKind::Asset => schemars::schema_for!(cvn_core::AssetRecord),
        SchemaKind::Provider => schemars::schema_for!(cvn_core::ProviderRecord),
        SchemaKind::Envelope => schemars::schema_for!(cvn_core::HookEnvelope),
        SchemaKind::Config => schemars::schema_for!(cvn_config::StudioConfig),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
