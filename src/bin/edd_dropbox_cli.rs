//! EDD Dropbox CLI — operate the Dropbox storage integration from a shell
//!
//! Usage:
//!   edd-dropbox-cli credentials <key> <secret>    Save app credentials
//!   edd-dropbox-cli authorize <redirect_uri>      Print the consent URL
//!   edd-dropbox-cli callback <redirect_uri> <query>  Finish authorization
//!   edd-dropbox-cli ls [path]                     List a folder
//!   edd-dropbox-cli link <path>                   Temporary download link
//!   edd-dropbox-cli upload <local> [--folder f]   Upload a product file
//!   edd-dropbox-cli config [--folder-limit n ...]  Show or change the client config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

use edd_dropbox::config::{self, ClientConfig};
use edd_dropbox::{
    upload_to_folder, Credentials, DownloadResolver, DropboxClient, JsonFileSettings,
    OAuthStates, TokenStore, TransientCache,
};

#[derive(Parser)]
#[command(
    name = "edd-dropbox-cli",
    about = "EDD Dropbox CLI — Dropbox storage for Easy Digital Downloads",
    version,
    long_about = "Connects a Dropbox app via OAuth2, browses folders, uploads product files\nand resolves edd-dropbox:// references into temporary download links."
)]
struct Cli {
    /// Client configuration file (default: <config dir>/edd-dropbox/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Settings file holding credentials and tokens
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show credentials, connection and folder state
    Status,
    /// Save the Dropbox app key and secret (changing them disconnects)
    Credentials {
        app_key: String,
        app_secret: String,
    },
    /// Print the authorization URL to open in a browser
    Authorize {
        /// Redirect URI registered in the Dropbox app console
        redirect_uri: String,
        /// Session the CSRF state is bound to
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Complete authorization with the query string Dropbox redirected to
    Callback {
        redirect_uri: String,
        /// Query string or full callback URL (code=...&state=...)
        query: String,
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// List files and folders
    Ls {
        /// Remote path (default: root)
        #[arg(default_value = "")]
        path: String,
    },
    /// List folders available for uploads
    Folders {
        #[arg(default_value = "")]
        path: String,
        /// Stop after this many folders (default from config)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show or set the default upload folder
    Folder {
        path: Option<String>,
    },
    /// Get a temporary download link for a file
    Link {
        path: String,
    },
    /// Resolve a stored file reference the way a download would
    Resolve {
        reference: String,
    },
    /// Upload a local file
    Upload {
        local: PathBuf,
        /// Destination folder (default: the selected folder)
        #[arg(long)]
        folder: Option<String>,
    },
    /// Show the connected account
    Account,
    /// Show the effective client configuration, or change and save it
    Config {
        /// RPC API base URL
        #[arg(long)]
        api_base: Option<String>,
        /// Content API base URL
        #[arg(long)]
        content_base: Option<String>,
        /// Connect timeout in seconds
        #[arg(long)]
        connect_timeout: Option<u64>,
        /// Total request timeout in seconds
        #[arg(long)]
        request_timeout: Option<u64>,
        /// Default folder listing cap
        #[arg(long)]
        folder_limit: Option<usize>,
        /// Reference prefix for Dropbox-resident files
        #[arg(long)]
        url_prefix: Option<String>,
        /// Write the config file even when nothing changed
        #[arg(long)]
        init: bool,
    },
    /// Forget the stored tokens
    Disconnect {
        /// Also revoke the token at Dropbox
        #[arg(long)]
        revoke: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config::get_config_path)
}

/// Runs before the config is validated so a broken file can be repaired
fn run_config(cli: &Cli) -> Result<()> {
    let Commands::Config {
        api_base,
        content_base,
        connect_timeout,
        request_timeout,
        folder_limit,
        url_prefix,
        init,
    } = &cli.command
    else {
        return Ok(());
    };

    let path = config_path(cli);
    let mut config = config::load_config_from(&path);
    let mut changed = *init;
    if let Some(v) = api_base {
        config.api_base = v.clone();
        changed = true;
    }
    if let Some(v) = content_base {
        config.content_base = v.clone();
        changed = true;
    }
    if let Some(v) = connect_timeout {
        config.connect_timeout_secs = *v;
        changed = true;
    }
    if let Some(v) = request_timeout {
        config.request_timeout_secs = *v;
        changed = true;
    }
    if let Some(v) = folder_limit {
        config.folder_limit = *v;
        changed = true;
    }
    if let Some(v) = url_prefix {
        config.url_prefix = v.clone();
        changed = true;
    }

    if changed {
        config::save_config_to(&path, &config).map_err(anyhow::Error::msg)?;
        println!("Config saved to {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

struct CliState {
    config: ClientConfig,
    tokens: TokenStore,
    states: OAuthStates,
}

fn open_state(cli: &Cli) -> Result<CliState> {
    let config = config::load_config_from(&config_path(cli));
    config::validate_config(&config).map_err(anyhow::Error::msg)?;

    let settings_path = cli.settings.clone().unwrap_or_else(JsonFileSettings::default_path);
    let settings = Arc::new(
        JsonFileSettings::open(settings_path.clone())
            .with_context(|| format!("Failed to open settings {}", settings_path.display()))?,
    );
    let cache = Arc::new(TransientCache::new(settings.clone()));

    let tokens = TokenStore::new(settings, cache.clone()).with_freshness_margin(config.freshness_margin());
    let states = OAuthStates::new(cache, config.oauth_state_ttl());

    Ok(CliState { config, tokens, states })
}

fn client(ctx: &CliState) -> Result<DropboxClient> {
    DropboxClient::with_reqwest(ctx.tokens.clone(), &ctx.config).context("Failed to create Dropbox client")
}

fn require_connected(ctx: &CliState) -> Result<()> {
    if !ctx.tokens.has_credentials() {
        bail!("Dropbox app key and secret are not configured (run `credentials`)");
    }
    if !ctx.tokens.is_connected() {
        bail!("Not connected to Dropbox (run `authorize`, then `callback`)");
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

async fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Commands::Config { .. }) {
        return run_config(&cli);
    }
    let ctx = open_state(&cli)?;

    match cli.command {
        Commands::Status => {
            let tokens = &ctx.tokens;
            println!("Credentials: {}", if tokens.has_credentials() { "configured" } else { "missing" });
            println!("Connected:   {}", if tokens.is_connected() { "yes" } else { "no" });
            if let Some(expiry) = tokens.token_expiry() {
                println!("Expires:     {}", expiry.to_rfc3339());
            }
            if tokens.is_connected() && tokens.is_expired() {
                println!("Token:       stale (refreshed on next call)");
            }
            let folder = tokens.selected_folder();
            println!("Folder:      {}", if folder.is_empty() { "/" } else { folder.as_str() });
        }
        Commands::Credentials { app_key, app_secret } => {
            let cleared = ctx.tokens.update_credentials(&Credentials::new(&app_key, &app_secret))?;
            println!("Credentials saved.");
            if cleared {
                println!("Stored tokens were cleared; authorize again.");
            }
        }
        Commands::Authorize { redirect_uri, session } => {
            let url = client(&ctx)?.authorization_redirect(&ctx.states, &session, &redirect_uri)?;
            println!("Open this URL to connect Dropbox:");
            println!("{}", url);
        }
        Commands::Callback { redirect_uri, query, session } => {
            client(&ctx)?
                .complete_authorization(&ctx.states, &session, &query, &redirect_uri)
                .await?;
            println!("Connected to Dropbox.");
        }
        Commands::Ls { path } => {
            require_connected(&ctx)?;
            let entries = client(&ctx)?.list_files(&path).await?;
            for entry in &entries {
                if entry.is_folder {
                    println!("{:>10}  {:<20}  {}/", "-", "", entry.path_display);
                } else {
                    let modified = entry
                        .modified_time
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default();
                    println!("{:>10}  {:<20}  {}", format_size(entry.size_bytes), modified, entry.path_display);
                }
            }
            println!("{} entries", entries.len());
        }
        Commands::Folders { path, limit } => {
            require_connected(&ctx)?;
            let client = client(&ctx)?;
            let limit = limit.unwrap_or(client.folder_limit());
            for folder in client.list_folders(&path, limit).await? {
                println!("{}", folder);
            }
        }
        Commands::Folder { path } => match path {
            Some(path) => {
                ctx.tokens.set_selected_folder(&path)?;
                println!("Upload folder set to {}", ctx.tokens.selected_folder());
            }
            None => {
                let folder = ctx.tokens.selected_folder();
                println!("{}", if folder.is_empty() { "/" } else { folder.as_str() });
            }
        },
        Commands::Link { path } => {
            require_connected(&ctx)?;
            println!("{}", client(&ctx)?.get_temporary_link(&path).await?);
        }
        Commands::Resolve { reference } => {
            let client = client(&ctx)?;
            let resolver = DownloadResolver::new(&client, &ctx.config.url_prefix);
            println!("{}", resolver.resolve(&reference).await);
        }
        Commands::Upload { local, folder } => {
            require_connected(&ctx)?;
            let content = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let file_name = local
                .file_name()
                .and_then(|n| n.to_str())
                .context("Local path has no usable file name")?
                .to_string();

            let stored = upload_to_folder(
                &client(&ctx)?,
                &ctx.config.url_prefix,
                folder.as_deref(),
                &file_name,
                content,
            )
            .await?;
            println!("Uploaded to {}", stored.path);
            println!("Reference: {}", stored.reference);
        }
        Commands::Account => {
            require_connected(&ctx)?;
            let account = client(&ctx)?.get_account_info().await?;
            println!("Account: {}", account.account_id);
            println!("Name:    {}", account.name.display_name);
            println!("Email:   {}{}", account.email, if account.email_verified { "" } else { " (unverified)" });
            if let Some(country) = account.country {
                println!("Country: {}", country);
            }
        }
        // Handled before the state is opened
        Commands::Config { .. } => {}
        Commands::Disconnect { revoke } => {
            client(&ctx)?.disconnect(revoke).await?;
            println!("Disconnected from Dropbox.");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
