use std::env;

use anyhow::{anyhow, bail, Context, Result};
use botadmin_core::auth::{AuthError, AuthManager, Principal, Session, ME_PATH};
use botadmin_core::config::ClientConfig;
use botadmin_core::http::{ApiError, Method, PendingRequest};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::task;
use tracing_subscriber::EnvFilter;

const PASSWORD_ENV: &str = "BOTADMIN_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about = "Bot administration console")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Session management
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Current administrator details
    #[command(subcommand)]
    User(UserCommand),
    /// Send an arbitrary request to the administration API
    Request(RequestArgs),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in with username and password
    Login(LoginArgs),
    /// Forget the stored session
    Logout,
    /// Exchange the refresh token for a new token pair
    Refresh,
    /// Show whether a session is stored
    Status(JsonArgs),
    /// Change the password of the logged-in administrator
    ChangePassword,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Fetch the logged-in administrator
    Me(JsonArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Administrator username
    #[arg(long, short)]
    username: String,
    /// Password; falls back to BOTADMIN_PASSWORD, then to a prompt
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct JsonArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    method: String,
    /// Path below the API base URL (e.g. users/42)
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(long = "query", short = 'q', value_parser = parse_query_pair)]
    query: Vec<(String, String)>,
    /// JSON request body
    #[arg(long)]
    data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ClientConfig::from_env().context("invalid configuration")?;
    tracing::debug!(base_url = %config.base_url, storage_key = %config.storage_key, "configuration loaded");
    let manager =
        AuthManager::with_default_storage(&config).context("unable to initialise session")?;

    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(&manager, args).await?,
            AuthCommand::Logout => auth_logout(&manager),
            AuthCommand::Refresh => auth_refresh(&manager).await?,
            AuthCommand::Status(args) => auth_status(&manager, args)?,
            AuthCommand::ChangePassword => auth_change_password(&manager).await?,
        },
        Commands::User(cmd) => match cmd {
            UserCommand::Me(args) => user_me(&manager, args).await?,
        },
        Commands::Request(args) => request(&manager, args).await?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn auth_login(manager: &AuthManager, args: LoginArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => match env::var(PASSWORD_ENV) {
            Ok(password) if !password.is_empty() => password,
            _ => prompt("Password: ").await?,
        },
    };

    if let Err(err) = manager.login(&args.username, &password).await {
        return Err(login_failure(err));
    }

    let session = manager.session();
    match &session.principal {
        Some(principal) => println!("Logged in as {} ({}).", principal.username, principal.role),
        None => println!("Logged in as {}.", args.username),
    }
    Ok(())
}

fn login_failure(err: AuthError) -> anyhow::Error {
    match err {
        AuthError::Api(ApiError::Transport(source)) => {
            anyhow!(source).context("unable to reach the administration API")
        }
        other => anyhow!("login failed: {}", other.user_message()),
    }
}

fn auth_logout(manager: &AuthManager) {
    manager.logout();
    println!("Session cleared.");
}

async fn auth_refresh(manager: &AuthManager) -> Result<()> {
    if !manager.refresh_access_token().await {
        bail!("session expired, log in again");
    }
    println!("Access token renewed.");
    Ok(())
}

fn auth_status(manager: &AuthManager, args: JsonArgs) -> Result<()> {
    let session = manager.session();
    if args.json {
        let status = json!({
            "is_authenticated": session.is_authenticated,
            "principal": session.principal,
            "persistent": manager.store().is_persistent(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    render_status(&session);
    if !manager.store().is_persistent() {
        println!("Session storage unavailable; this session is not persisted.");
    }
    Ok(())
}

async fn auth_change_password(manager: &AuthManager) -> Result<()> {
    ensure_logged_in(manager)?;
    let current = prompt("Current password: ").await?;
    let new = prompt("New password: ").await?;
    let confirm = prompt("Repeat new password: ").await?;
    if new != confirm {
        bail!("passwords do not match");
    }
    manager
        .change_password(&current, &new)
        .await
        .map_err(api_failure)?;
    println!("Password changed.");
    Ok(())
}

async fn user_me(manager: &AuthManager, args: JsonArgs) -> Result<()> {
    ensure_logged_in(manager)?;
    let principal = manager
        .send(PendingRequest::get(ME_PATH))
        .await
        .and_then(|response| response.json::<Principal>())
        .map_err(api_failure)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&principal)?);
    } else {
        render_principal(&principal);
    }
    Ok(())
}

async fn request(manager: &AuthManager, args: RequestArgs) -> Result<()> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid HTTP method '{}'", args.method))?;
    let mut request = PendingRequest::new(method, args.path);
    for (key, value) in args.query {
        request = request.query(key, value);
    }
    if let Some(data) = args.data {
        let body: serde_json::Value =
            serde_json::from_str(&data).context("--data must be valid JSON")?;
        request = request.json(body);
    }

    let response = manager.send(request).await.map_err(api_failure)?;
    match serde_json::from_str::<serde_json::Value>(response.text()) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn ensure_logged_in(manager: &AuthManager) -> Result<()> {
    if !manager.is_authenticated() {
        bail!("not logged in; run `botadmin auth login` first");
    }
    Ok(())
}

fn api_failure(err: ApiError) -> anyhow::Error {
    match err.detail() {
        Some(detail) => anyhow!("{detail}"),
        None => anyhow!(err),
    }
}

fn render_status(session: &Session) {
    if !session.is_authenticated {
        println!("Not logged in.");
        return;
    }
    match &session.principal {
        Some(principal) => println!("Logged in as {} ({}).", principal.username, principal.role),
        None => println!("Logged in."),
    }
}

fn render_principal(principal: &Principal) {
    println!("{} (#{})", principal.username, principal.id);
    println!("  role:       {}", principal.role);
    println!("  active:     {}", if principal.is_active { "yes" } else { "no" });
    if let Some(last_login) = principal.last_login_at {
        println!("  last login: {last_login}");
    }
    println!("  created:    {}", principal.created_at);
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty query key in '{raw}'"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

async fn prompt(label: &'static str) -> Result<String> {
    task::spawn_blocking(move || -> std::io::Result<String> {
        use std::io::{self, Write};
        print!("{label}");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim_end_matches(['\r', '\n']).to_owned())
    })
    .await
    .context("prompt cancelled")?
    .context("failed to read from stdin")
}
