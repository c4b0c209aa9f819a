use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use serde_json::Value;
use std::sync::Arc;

use hustle_client::auth::{Session, SessionInvalidHook, SqliteTokenStore};
use hustle_client::config::{CliArgs, Command, Config};
use hustle_client::error::SessionInvalidReason;
use hustle_client::http_client::ApiClient;
use hustle_client::models::ApiResponse;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        base_url = %config.base_url,
        session_db = %config.session_db.display(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteTokenStore::open(&config.session_db)?);

    // The CLI's stand-in for redirecting to the login page
    let on_invalid: SessionInvalidHook = Arc::new(|reason: &SessionInvalidReason| {
        eprintln!("Session expired ({}). Run `hustle login` to sign in again.", reason);
    });

    let session = Arc::new(
        Session::new(store.clone())
            .with_invalid_hook(on_invalid)
            .with_refresh_timeout(config.refresh_timeout),
    );
    let client = ApiClient::new(config.client_settings(), session.clone())?;

    match args.command {
        Command::Login { email, password } => {
            let email = match email {
                Some(email) => email,
                None => Input::new()
                    .with_prompt("Email")
                    .interact_text()
                    .context("Failed to read email")?,
            };
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            client.login(&email, &password).await?;
            let user = client.current_user().await?;
            println!("✅ Logged in as {}", user.display_name());
        }

        Command::Logout => {
            client.logout().await?;
            println!("👋 Logged out");
        }

        Command::Me => {
            let user = client.current_user().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }

        Command::Status => print_status(&session, &store)?,

        Command::Get { path, query } => {
            print_response(client.get_with_query(&path, &query).await?)?;
        }

        Command::Post { path, data } => {
            let body = match data {
                Some(data) => parse_body(&data)?,
                None => Value::Object(Default::default()),
            };
            print_response(client.post(&path, &body).await?)?;
        }

        Command::Patch { path, data } => {
            print_response(client.patch(&path, &parse_body(&data)?).await?)?;
        }

        Command::Delete { path } => {
            print_response(client.delete(&path).await?)?;
        }
    }

    Ok(())
}

fn parse_body(data: &str) -> Result<Value> {
    serde_json::from_str(data).context("Request body must be valid JSON")
}

fn print_response(response: ApiResponse) -> Result<()> {
    tracing::info!(status = response.status, "Response received");
    if !response.body.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.body)?);
    }
    Ok(())
}

/// Print which tokens are stored and when they were written
fn print_status(session: &Session, store: &SqliteTokenStore) -> Result<()> {
    use hustle_client::auth::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

    let access = session.access_token()?;
    let refresh = session.refresh_token()?;

    match access {
        Some(token) => println!(
            "  Access token:  {}... (updated {})",
            token.chars().take(12).collect::<String>(),
            format_updated(store, ACCESS_TOKEN_KEY)?
        ),
        None => println!("  Access token:  none"),
    }
    match refresh {
        Some(_) => println!(
            "  Refresh token: stored (updated {})",
            format_updated(store, REFRESH_TOKEN_KEY)?
        ),
        None => println!("  Refresh token: none"),
    }

    Ok(())
}

fn format_updated(store: &SqliteTokenStore, key: &str) -> Result<String> {
    Ok(store
        .updated_at(key)?
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string()))
}
