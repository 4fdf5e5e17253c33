//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use schoolhub_core::config::{self, paths};
use schoolhub_core::logging;
use schoolhub_core::session::SessionManager;

mod commands;

#[derive(Parser)]
#[command(name = "schoolhub")]
#[command(version)]
#[command(about = "SchoolHub account and profile client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create an account and its profile
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "SCHOOLHUB_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        phone: String,
    },

    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "SCHOOLHUB_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Send a password reset email
    ResetPassword {
        #[arg(long)]
        email: String,
    },

    /// Show the signed-in user
    Whoami {
        /// Print the merged user as JSON
        #[arg(long)]
        json: bool,
    },

    /// View or edit the signed-in user's profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Change the signed-in user's password
    ChangePassword {
        #[arg(long, env = "SCHOOLHUB_NEW_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, env = "SCHOOLHUB_CONFIRM_PASSWORD", hide_env_values = true)]
        confirm: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ProfileCommands {
    /// Shows the stored profile
    Show,
    /// Updates profile fields
    Set {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Free-form field as KEY=VALUE (repeatable)
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Point the client at a Firebase project
    SetProject {
        #[arg(value_name = "PROJECT_ID")]
        project_id: String,
        /// Web API key of the project
        #[arg(long)]
        api_key: Option<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to a file so stdout stays reserved for command output.
    let _log_guard = match logging::init(&paths::logs_dir()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: logging disabled: {e:#}");
            None
        }
    };

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Config { command } => config_command(command),
        command => {
            let config = config::Config::load().context("load config")?;
            let session = commands::open_session(&config).await?;
            let result = session_command(session, command).await;
            commands::finish(session, result.is_ok()).await;
            result
        }
    }
}

fn config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Path => {
            commands::config::path();
            Ok(())
        }
        ConfigCommands::Init => commands::config::init(),
        ConfigCommands::SetProject {
            project_id,
            api_key,
        } => commands::config::set_project(&project_id, api_key.as_deref()),
    }
}

async fn session_command(session: &SessionManager, command: Commands) -> Result<()> {
    match command {
        Commands::Register {
            email,
            password,
            username,
            phone,
        } => commands::auth::register(session, &email, &password, &username, &phone).await,
        Commands::Login { email, password } => {
            commands::auth::login(session, &email, &password).await
        }
        Commands::Logout => commands::auth::logout(session).await,
        Commands::ResetPassword { email } => commands::auth::reset_password(session, &email).await,
        Commands::Whoami { json } => commands::auth::whoami(session, json).await,
        Commands::Profile { command } => match command {
            ProfileCommands::Show => commands::profile::show(session).await,
            ProfileCommands::Set {
                username,
                phone,
                fields,
            } => commands::profile::set(session, username, phone, &fields).await,
        },
        Commands::ChangePassword { password, confirm } => {
            commands::auth::change_password(session, &password, &confirm).await
        }
        Commands::Config { command } => config_command(command),
    }
}
