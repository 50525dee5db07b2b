use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    process::ExitCode,
};

use ankibridge::{
    anki::mapping::known_template,
    core::config::parse_field_override,
    AnkiClient,
    BridgeConfig,
    BridgeError,
    ContentRecord,
    ImportOutcome,
    ImportRequest,
};
use clap::{
    Parser,
    Subcommand,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Sends generated flashcards to Anki through AnkiConnect.
#[derive(Parser)]
#[command(name = "ankibridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: config.json in the user data directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that Anki and AnkiConnect are ready for an import.
    Status,

    /// List note types and their fields.
    Templates,

    /// Import a JSON array of cards.
    Import {
        /// File with `[{"front": ..., "back": ..., "extra": ...}, ...]`.
        file: PathBuf,

        /// Target deck, created if missing.
        #[arg(short, long)]
        deck: Option<String>,

        /// Note type to use.
        #[arg(short, long)]
        template: Option<String>,

        /// Extra tag for every note (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Let Anki store cards that already exist in the deck.
        #[arg(long)]
        allow_duplicates: bool,

        /// Fixed text for a note type field, as NAME=VALUE (repeatable).
        #[arg(long = "field", value_name = "NAME=VALUE", value_parser = parse_field_override)]
        fields: Vec<(String, String)>,
    },

    /// Write the current configuration to the configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ankibridge=debug" } else { "ankibridge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "could not start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, BridgeError> {
    let config_path = cli.config;
    let load = || BridgeConfig::load(config_path.as_deref());

    match cli.command {
        Commands::Status => cmd_status(&load()?).await,
        Commands::Templates => cmd_templates(&load()?).await,
        Commands::Import { file, deck, template, tags, allow_duplicates, fields } => {
            let config = load()?;
            let mut request = ImportRequest::from_config(&config).with_tags(tags);
            if let Some(deck) = deck {
                request.deck_name = deck;
            }
            if let Some(template) = template {
                request.template_name = template;
            }
            request.allow_duplicates |= allow_duplicates;
            request.field_overrides.extend(fields);
            cmd_import(&config, &file, &request).await
        }
        Commands::InitConfig { force } => {
            let path = config_path.clone().unwrap_or_else(BridgeConfig::default_path);
            let config = if path.exists() {
                load()?
            } else {
                BridgeConfig::default().with_overrides(|key| std::env::var(key).ok())?
            };
            cmd_init_config(&config, &path, force)
        }
    }
}

async fn cmd_status(config: &BridgeConfig) -> Result<ExitCode, BridgeError> {
    let client = AnkiClient::connect(config)?;
    let status = client.connection_status().await;

    println!("{}", status.message);
    println!("  Anki running:        {}", yes_no(status.peer_running));
    println!("  AnkiConnect:         {}", yes_no(status.add_on_available));
    match status.version {
        Some(version) => println!("  AnkiConnect version: {} ({})", version, ok_or_old(status.valid_version)),
        None => println!("  AnkiConnect version: unknown"),
    }
    println!("  Note types listed:   {}", yes_no(status.templates_available));
    println!("  Decks listed:        {}", yes_no(status.decks_available));
    if let Some(details) = &status.error_details {
        println!("  Details: {}", details);
    }

    Ok(if status.is_ready() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn cmd_templates(config: &BridgeConfig) -> Result<ExitCode, BridgeError> {
    let client = AnkiClient::connect(config)?;
    let mut templates = client.templates().await?;
    templates.sort_by(|a, b| a.name.cmp(&b.name));

    for template in templates {
        let marker = if known_template(&template.name).is_some() { "*" } else { " " };
        println!("{} {}: {}", marker, template.name, template.field_names.join(", "));
    }
    println!("(* = fields mapped from a built-in table, others by field name)");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_import(
    config: &BridgeConfig,
    file: &Path,
    request: &ImportRequest,
) -> Result<ExitCode, BridgeError> {
    let records: Vec<ContentRecord> = serde_json::from_str(&fs::read_to_string(file)?)?;
    if records.is_empty() {
        println!("{} contains no cards.", file.display());
        return Ok(ExitCode::SUCCESS);
    }

    let client = AnkiClient::connect(config)?;
    let outcome = client.import_batch(&records, request).await?;
    println!("{}", outcome.summary());

    Ok(exit_code(&outcome))
}

fn cmd_init_config(config: &BridgeConfig, path: &Path, force: bool) -> Result<ExitCode, BridgeError> {
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(ExitCode::FAILURE);
    }
    config.save(path)?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// 0 when every card landed, 2 for a partial import, 1 when nothing did.
fn exit_code(outcome: &ImportOutcome) -> ExitCode {
    if outcome.is_complete() {
        ExitCode::SUCCESS
    } else if outcome.persisted_count > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn ok_or_old(valid: bool) -> &'static str {
    if valid { "ok" } else { "too old, 6 or newer required" }
}
