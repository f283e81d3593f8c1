//! Castellan CLI - alias-keyed session and transaction facility over SQLite

use castellan_core::config::FacilityConfig;
use castellan_core::domain::activity;
use castellan_core::facility::{FacilityBuilder, SessionFacility};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "castellan")]
#[command(author, version, about = "Alias-keyed session and transaction facility for SQLite", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Check,

    /// List configured database aliases
    Aliases,

    /// Build the facility and probe each configured database
    Ping {
        /// Probe a single alias instead of all of them
        #[arg(short, long)]
        alias: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("castellan_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => FacilityConfig::config_path()?,
    };

    match cli.command {
        Commands::Check => cmd_check(&config_path, cli.quiet),

        Commands::Aliases => cmd_aliases(&config_path, cli.format, cli.quiet),

        Commands::Ping { alias } => cmd_ping(&config_path, alias.as_deref(), cli.quiet).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn describe_target(config: &castellan_core::config::AliasConfig) -> String {
    match &config.path {
        Some(path) => path.display().to_string(),
        None => ":memory:".to_string(),
    }
}

fn cmd_check(config_path: &Path, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Castellan Configuration Check");
        println!("=============================");
        println!();

        if config_path.exists() {
            println!("[OK] Config file: {}", config_path.display());
        } else {
            println!("[--] Config file: {} (using defaults)", config_path.display());
        }
    }

    let config = match FacilityConfig::load_from(config_path) {
        Ok(config) => config,
        Err(e) => {
            if !quiet {
                println!("[!!] Configuration: {:#}", e);
            }
            return Err(e);
        }
    };

    if !quiet {
        println!("[OK] Configuration: Valid");
        println!("     Session store: {}", config.facility.session_store);
        println!(
            "     Default flush mode: {}",
            config.facility.default_flush_mode
        );
        println!(
            "     Configuration builder: {}",
            config.facility.configuration_builder
        );

        if config.databases.is_empty() {
            println!("[--] Databases: none configured");
            println!("     Add a [[database]] entry to {}", config_path.display());
        } else {
            println!("[OK] Databases: {} configured", config.databases.len());
            for database in &config.databases {
                println!("     {} -> {}", database.alias, describe_target(database));
            }
        }

        println!();
        println!("Configuration check passed.");
    }

    Ok(())
}

fn cmd_aliases(config_path: &Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = FacilityConfig::load_from(config_path)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config.databases)?);
        }
        OutputFormat::Text => {
            if config.databases.is_empty() {
                if !quiet {
                    println!("No databases configured.");
                    println!("\nAdd a [[database]] entry to {}", config_path.display());
                }
            } else {
                if !quiet {
                    println!("Aliases:");
                }
                for database in &config.databases {
                    let flush_mode = database
                        .flush_mode
                        .unwrap_or(config.facility.default_flush_mode);
                    println!(
                        "  {} -> {} ({})",
                        database.alias,
                        describe_target(database),
                        flush_mode
                    );
                }
            }
        }
    }

    Ok(())
}

async fn cmd_ping(config_path: &Path, alias: Option<&str>, quiet: bool) -> anyhow::Result<()> {
    let config = FacilityConfig::load_from(config_path)?;
    if config.databases.is_empty() {
        return Err(anyhow::anyhow!(
            "No databases configured. Add a [[database]] entry to {}",
            config_path.display()
        ));
    }

    let facility = FacilityBuilder::with_config(config).build().await?;

    let aliases: Vec<String> = match alias {
        Some(alias) => vec![alias.to_string()],
        None => facility.aliases(),
    };

    let mut all_ok = true;
    for alias in &aliases {
        match probe(&facility, alias).await {
            Ok(()) => {
                if !quiet {
                    println!("[OK] {}: responded", alias);
                }
            }
            Err(e) => {
                all_ok = false;
                println!("[!!] {}: {:#}", alias, e);
            }
        }
    }

    facility.close().await;

    if all_ok {
        Ok(())
    } else {
        Err(anyhow::anyhow!("One or more databases failed the probe"))
    }
}

/// Open a session for the alias and run a trivial query through it
async fn probe(facility: &SessionFacility, alias: &str) -> anyhow::Result<()> {
    activity::scope(async {
        let session = facility.open_session_for(alias).await?;
        let value = session.fetch_scalar("SELECT 1", vec![]).await?;
        session.close().await?;

        if value != 1 {
            return Err(anyhow::anyhow!("probe query returned {}", value));
        }
        Ok(())
    })
    .await
}
