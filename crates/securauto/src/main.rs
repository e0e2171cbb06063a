use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod audit;
mod csv;
mod dashboard;
mod db;
mod error;
mod html;
mod parser;
mod profile;
mod provisioning;
mod realtime;
mod server;
mod session;
mod storage;
mod store;
mod types;

use session::{AdminSession, NewAdmin};
use store::{DocumentStore, Query};
use types::{collections, AdminCredential, AdminRole};

const DB_FILE: &str = "securauto.db";
const SESSIONS_FILE: &str = "sessions.json";

#[derive(Parser, Debug)]
#[command(name = "securauto")]
#[command(about = "Admin dashboard for the SecurAuto vehicle tracking service")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding the database and persisted sessions
    #[arg(long, env = "SECURAUTO_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "SECURAUTO_PORT", default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "SECURAUTO_BIND", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Mark the session cookie Secure (serve behind HTTPS)
    #[arg(long, env = "SECURAUTO_SECURE_COOKIES")]
    secure_cookies: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the web server (default)
    Serve(ServeArgs),

    /// Create an admin account
    CreateAdmin {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        #[arg(long, default_value = "")]
        display_name: String,

        /// global_admin or legion_admin
        #[arg(long, default_value = "legion_admin")]
        role: AdminRole,

        /// Required for legion admins
        #[arg(long)]
        legion: Option<String>,
    },

    /// Import approved users from a spreadsheet
    Import {
        /// Path to an xlsx/xls/ods or SpreadsheetML file
        file: PathBuf,

        /// Email of the admin the import is recorded against
        #[arg(long)]
        admin: String,
    },

    /// Export a legion's detections as CSV
    Export {
        #[arg(long)]
        legion: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the stored hash for a password
    HashPassword { password: String },
}

fn init_tracing(log_level: &str) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    for directive in ["hyper=warn", "tower_http=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so `export` can write CSV to stdout
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(data_dir: &Path) -> Result<Arc<DocumentStore>> {
    let path = data_dir.join(DB_FILE);
    let store = DocumentStore::open(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// A one-off session for CLI actions recorded against an admin
fn cli_session(store: &DocumentStore, email: &str) -> Result<AdminSession> {
    let query = Query::new(collections::ADMINS).where_eq("email", email.trim()).limit(1);
    let (credential_id, credential) = store
        .query_as::<AdminCredential>(&query)?
        .into_iter()
        .next()
        .with_context(|| format!("No admin account for {}", email))?;
    if !credential.active {
        anyhow::bail!("Admin account {} is disabled", email);
    }

    Ok(AdminSession {
        id: Uuid::new_v4(),
        credential_id,
        admin: credential.profile(),
        captured_at: Utc::now(),
    })
}

async fn serve(data_dir: &Path, args: ServeArgs) -> Result<()> {
    let store = open_store(data_dir)?;
    let storage = storage::LocalStorage::new(data_dir.join(SESSIONS_FILE));
    let state = Arc::new(server::AppState::new(store, storage, args.secure_cookies));
    if !args.secure_cookies {
        warn!("Session cookies are not marked Secure");
    }
    server::serve(state, SocketAddr::new(args.bind, args.port)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(&args.log_level);

    match args.command {
        // Default to serve if no command specified
        None => {
            let serve_args = ServeArgs::parse_from(["securauto"]);
            serve(&args.data_dir, serve_args).await?;
        }
        Some(Commands::Serve(serve_args)) => {
            serve(&args.data_dir, serve_args).await?;
        }
        Some(Commands::CreateAdmin {
            email,
            password,
            display_name,
            role,
            legion,
        }) => {
            let store = open_store(&args.data_dir)?;
            let admin = NewAdmin {
                email,
                password,
                display_name,
                role,
                legion,
                permissions: BTreeMap::new(),
            };
            let id = session::create_admin(&store, admin, Utc::now())?;
            info!(id = %id, "Admin created");
        }
        Some(Commands::Import { file, admin }) => {
            let store = open_store(&args.data_dir)?;
            let session = cli_session(&store, &admin)?;
            let rows = parser::parse_user_file(&file)?;
            let report = provisioning::import_batch(&store, &session, &rows, Utc::now())?;

            info!(
                imported = report.imported,
                errors = report.errors,
                file = %file.display(),
                "Import complete"
            );
            for err in &report.row_errors {
                warn!(line = err.line, reason = %err.message, "Row skipped");
            }
        }
        Some(Commands::Export { legion, output }) => {
            let store = open_store(&args.data_dir)?;
            let (text, rows) = dashboard::render_legion_csv(&store, legion.trim())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(rows = rows, path = %path.display(), "CSV saved");
                }
                None => print!("{}", text),
            }
        }
        Some(Commands::HashPassword { password }) => {
            println!("{}", session::hash_password(&password));
        }
    }

    Ok(())
}
