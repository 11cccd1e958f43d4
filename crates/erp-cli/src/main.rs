use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use erp_store::paths::secure_prefs_path;
use erp_store::{
    reset_installation, AuthenticationMode, KeyBackendKind, StoreConfig, StoreHolder, StoreModule,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "erp-store")]
#[command(about = "Inspect and maintain the encrypted eRezept store", long_about = None)]
struct Cli {
    /// Directory holding the store and its secure preferences
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Where the master key is kept: keyring, file or ephemeral
    #[arg(long, global = true)]
    key_backend: Option<KeyBackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the store and create the settings record if missing
    Init,

    /// Open the store and print its state
    Status,

    /// Read or change general settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Delete the store, its secure preferences and the master key
    Reset {
        /// Required, the store cannot be recovered afterwards
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the settings record and profiles
    Show,

    /// Record acceptance of the current data protection terms
    AcceptTerms,

    /// Finish onboarding with a first profile
    Onboard {
        #[arg(long)]
        profile: String,

        #[arg(long, value_enum, default_value = "device-security")]
        mode: AuthMode,
    },

    /// Enable or disable zoom
    Zoom {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Count a failed authentication attempt
    AuthFailure,

    /// Clear the failed authentication counter
    ResetAuthFailures,
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthMode {
    DeviceSecurity,
    Password,
}

impl From<AuthMode> for AuthenticationMode {
    fn from(mode: AuthMode) -> Self {
        match mode {
            AuthMode::DeviceSecurity => AuthenticationMode::DeviceSecurity,
            AuthMode::Password => AuthenticationMode::Password,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.data_dir, cli.key_backend)?;
    match cli.command {
        Commands::Init => init_command(config),
        Commands::Status => status_command(config),
        Commands::Settings { action } => settings_command(config, action),
        Commands::Reset { yes } => reset_command(config, yes),
    }
}

fn load_config(data_dir: Option<PathBuf>, key_backend: Option<KeyBackendKind>) -> Result<StoreConfig> {
    let mut config = StoreConfig::from_env().context("loading store configuration")?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(backend) = key_backend {
        config.key_backend = backend;
    }
    Ok(config)
}

fn open(config: StoreConfig) -> Result<StoreModule> {
    let data_dir = config.data_dir.display().to_string();
    StoreModule::build(config).with_context(|| format!("opening store in {data_dir}"))
}

fn init_command(config: StoreConfig) -> Result<()> {
    let module = open(config)?;
    let created = module.settings.ensure_initialized(&module.config.build)?;
    print_json(&json!({
        "database": module.database.path(),
        "schemaVersion": module.database.schema_version(),
        "settingsCreated": created,
    }))
}

fn status_command(config: StoreConfig) -> Result<()> {
    let module = open(config)?;
    let settings = module.settings.general().ok();
    print_json(&json!({
        "state": format!("{:?}", StoreHolder::global().state()),
        "dataDir": module.config.data_dir,
        "database": module.database.path(),
        "securePreferences": module.secure_prefs.path(),
        "keyBackend": module.config.key_backend.to_string(),
        "schemaVersion": module.database.schema_version(),
        "latestAppVersionName": settings.as_ref().map(|s| s.latest_app_version_name.clone()),
        "latestAppVersionCode": settings.as_ref().map(|s| s.latest_app_version_code),
    }))
}

fn settings_command(config: StoreConfig, action: SettingsAction) -> Result<()> {
    let module = open(config)?;
    let settings = &module.settings;
    match action {
        SettingsAction::Show => {}
        SettingsAction::AcceptTerms => settings.accept_updated_data_terms(Utc::now())?,
        SettingsAction::Onboard { profile, mode } => {
            settings.save_onboarding_succeeded_data(mode.into(), &profile, Utc::now())?
        }
        SettingsAction::Zoom { enabled } => settings.save_zoom_preference(enabled)?,
        SettingsAction::AuthFailure => {
            let count = settings.increment_number_of_authentication_failures()?;
            info!(count, "authentication failure recorded");
        }
        SettingsAction::ResetAuthFailures => settings.reset_number_of_authentication_failures()?,
    }
    print_json(&json!({
        "settings": settings.general()?,
        "profiles": settings.profiles()?,
    }))
}

fn reset_command(config: StoreConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to reset without --yes");
    }
    reset_installation(&config, StoreHolder::global())?;
    print_json(&json!({
        "removed": [
            config.database_path(),
            secure_prefs_path(&config.data_dir, &config.prefs_file_name),
        ],
    }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
