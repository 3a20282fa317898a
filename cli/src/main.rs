mod commands;
mod completion;
mod config;
mod extraction;
mod importer;
mod logging;
mod payments;
mod server;
mod tls;
mod upstream;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::commands::{
    cmd_recipe_delete, cmd_recipe_import, cmd_recipe_list, cmd_recipe_show, cmd_team_accept,
    cmd_team_invite, cmd_team_list, cmd_user_add, cmd_user_list, cmd_user_revoke, cmd_user_token,
};
use crate::config::Config;
use crate::importer::Importer;
use crate::logging::LoggingConfig;
use crate::tls::TlsConfig;
use brigade_core::service::BrigadeService;

#[derive(Parser)]
#[command(
    name = "brigade",
    version,
    about = "Recipe management for restaurant kitchens",
    long_about = "Recipe management for restaurant kitchens.\n\n\
        Runs the REST server (`brigade serve`) and administers the same database \
        from the command line."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Enable TLS (HTTPS). Generates a self-signed certificate on first use.
        #[arg(long)]
        tls: bool,
        /// Path to TLS certificate file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_key: Option<PathBuf>,
    },
    /// Manage users and their API tokens
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Manage your kitchen team
    Team {
        #[command(subcommand)]
        command: TeamCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add {
        /// Email address (login identity)
        email: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
        /// Restaurant name
        #[arg(long, default_value = "")]
        restaurant: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List users
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Issue a bearer token for a user
    Token {
        /// Email address of the user
        email: String,
        /// Issue a long-lived token (30 days instead of 12 hours)
        #[arg(long)]
        remember: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revoke a bearer token
    Revoke {
        /// The token to revoke
        token: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// List recipes readable by a user
    List {
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a recipe with its sections and ingredients
    Show {
        /// Recipe ID
        id: i64,
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a recipe from a document (.txt, .docx, .doc, .pdf)
    Import {
        /// Path to the document
        file: PathBuf,
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Save the imported recipe instead of printing a draft
        #[arg(long)]
        save: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe you own
    Delete {
        /// Recipe ID
        id: i64,
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TeamCommands {
    /// Invite someone to your team
    Invite {
        /// Email address to invite
        email: String,
        /// Role: editor or viewer
        #[arg(short, long, default_value = "editor")]
        role: String,
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Accept an invitation
    Accept {
        /// Invitation token
        token: String,
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List team members and pending invitations
    List {
        /// Act as this user (email)
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    LoggingConfig::from_env().init()?;

    let config = Config::load()?;
    let db_path = config.db_path.to_str().context("Database path is not valid UTF-8")?;
    let service = BrigadeService::new(db_path)?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            tls,
            tls_cert,
            tls_key,
        } => {
            let tls_config = if tls || tls_cert.is_some() || tls_key.is_some() {
                Some(TlsConfig::resolve(&config.data_dir, tls_cert, tls_key)?)
            } else {
                None
            };
            server::start_server(service, &config.services, port, &bind, tls_config).await
        }
        Commands::User { command } => match command {
            UserCommands::Add {
                email,
                name,
                restaurant,
                json,
            } => cmd_user_add(&service, &email, &name, &restaurant, json),
            UserCommands::List { json } => cmd_user_list(&service, json),
            UserCommands::Token {
                email,
                remember,
                json,
            } => cmd_user_token(&service, &email, remember, json),
            UserCommands::Revoke { token, json } => cmd_user_revoke(&service, &token, json),
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::List { user, json } => cmd_recipe_list(&service, &user, json),
            RecipeCommands::Show { id, user, json } => cmd_recipe_show(&service, &user, id, json),
            RecipeCommands::Import {
                file,
                user,
                save,
                json,
            } => {
                let importer = Importer::new(&config.services)?;
                cmd_recipe_import(&service, &importer, &user, &file, save, json).await
            }
            RecipeCommands::Delete { id, user, json } => {
                cmd_recipe_delete(&service, &user, id, json)
            }
        },
        Commands::Team { command } => match command {
            TeamCommands::Invite {
                email,
                role,
                user,
                json,
            } => cmd_team_invite(&service, &user, &email, &role, json),
            TeamCommands::Accept { token, user, json } => {
                cmd_team_accept(&service, &user, &token, json)
            }
            TeamCommands::List { user, json } => cmd_team_list(&service, &user, json),
        },
    }
}
