use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledgerlens::config::Config;
use ledgerlens::extract::{Engine, JobKind};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ledgerlens",
    about = "Extract quotes, slide insights and narratives from financial documents",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an extraction job on a JSON request file and print the result
    Run {
        /// Job to run: quotes, slides or narrative
        job: JobKind,
        /// Path to the JSON request body ("-" reads stdin)
        request: PathBuf,
        /// Override the provider named in the request
        #[arg(long)]
        provider: Option<String>,
        /// Override the model named in the request
        #[arg(long)]
        model: Option<String>,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration with keys masked
    Show,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_request(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut body = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut body)
            .context("Failed to read request from stdin")?;
        return Ok(body);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))
}

/// Apply CLI provider/model overrides to the request body.
fn apply_overrides(body: String, provider: Option<String>, model: Option<String>) -> Result<String> {
    if provider.is_none() && model.is_none() {
        return Ok(body);
    }
    let mut value: serde_json::Value =
        serde_json::from_str(&body).context("Request file is not valid JSON")?;
    let object = value
        .as_object_mut()
        .context("Request body must be a JSON object")?;
    if let Some(provider) = provider {
        object.insert("provider".to_string(), provider.into());
    }
    if let Some(model) = model {
        object.insert("model".to_string(), model.into());
    }
    Ok(serde_json::to_string(&value)?)
}

async fn run_job(
    job: JobKind,
    request: PathBuf,
    provider: Option<String>,
    model: Option<String>,
) -> Result<ExitCode> {
    let config = Config::load();
    let engine = Engine::from_config(&config)?;
    let body = apply_overrides(read_request(&request)?, provider, model)?;

    match engine.handle(job, &body).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn config_command(action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Init { force } => {
            let path = Config::config_path().context("Could not determine config directory")?;
            if path.exists() && !force {
                eprintln!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
                return Ok(ExitCode::FAILURE);
            }
            let path = Config::default().save()?;
            eprintln!("+ Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            let config = Config::load();
            let credentials = config.credentials();
            eprintln!("Config file: {}", Config::config_location());
            for provider in config_providers() {
                let state = if credentials.contains_key(provider) {
                    "key available"
                } else {
                    "no key"
                };
                eprintln!("  {provider}: {state}");
            }
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn config_providers() -> [&'static str; 2] {
    [
        ledgerlens::config::HOSTED_PROVIDER,
        ledgerlens::config::AGGREGATOR_PROVIDER,
    ]
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Run {
            job,
            request,
            provider,
            model,
        } => run_job(job, request, provider, model).await,
        Command::Config { action } => config_command(action),
    }
}
