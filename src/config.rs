use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ClientError;

/// HustleHub API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the HustleHub API
    #[arg(
        short = 'u',
        long,
        env = "HUSTLEHUB_API_URL",
        default_value = "http://localhost:8000/api"
    )]
    pub base_url: String,

    /// Path to the session database holding the tokens
    #[arg(short = 'd', long, env = "HUSTLEHUB_SESSION_DB")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Token refresh timeout in seconds (0 waits indefinitely)
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "0")]
    pub refresh_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the session tokens
    Login {
        #[arg(short, long, env = "HUSTLEHUB_EMAIL")]
        email: Option<String>,

        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Log out and forget the stored tokens
    Logout,

    /// Show the logged-in user
    Me,

    /// Show whether a session is stored
    Status,

    /// GET a resource
    Get {
        path: String,

        /// Query parameter as key=value, repeatable
        #[arg(short, long = "query", value_parser = parse_query_pair)]
        query: Vec<(String, String)>,
    },

    /// POST a JSON body
    Post {
        path: String,

        #[arg(short = 'j', long)]
        data: Option<String>,
    },

    /// PATCH with a JSON body
    Patch {
        path: String,

        #[arg(short = 'j', long)]
        data: String,
    },

    /// DELETE a resource
    Delete { path: String },
}

/// Settings consumed by the API client
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,

    // Endpoints
    pub refresh_path: String,
    pub login_path: String,
    pub logout_path: String,
    pub me_path: String,

    // HTTP client
    pub max_connections: usize,
    pub connect_timeout: u64,
    pub request_timeout: u64,
}

impl ClientSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: "/token/refresh/".to_string(),
            login_path: "/auth/login/".to_string(),
            logout_path: "/auth/logout/".to_string(),
            me_path: "/users/me/".to_string(),
            max_connections: 20,
            connect_timeout: 10,
            request_timeout: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: String,
    pub refresh_path: String,

    // Session storage
    pub session_db: PathBuf,

    // Timeouts
    pub refresh_timeout: Option<Duration>,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let session_db = args
            .db_file
            .as_deref()
            .map(expand_tilde)
            .or_else(default_session_db)
            .context("Cannot locate a data directory (use -d or set HUSTLEHUB_SESSION_DB)")?;

        let config = Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),

            refresh_path: std::env::var("REFRESH_PATH")
                .unwrap_or_else(|_| "/token/refresh/".to_string()),

            session_db,

            refresh_timeout: parse_refresh_timeout(args.refresh_timeout),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ClientError::Config(format!(
                "HUSTLEHUB_API_URL is not a valid URL: {} ({})",
                self.base_url, e
            ))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "HUSTLEHUB_API_URL must use http or https, got: {}",
                url.scheme()
            )));
        }

        if !self.refresh_path.starts_with('/') {
            return Err(ClientError::Config(format!(
                "REFRESH_PATH must start with '/': {}",
                self.refresh_path
            )));
        }

        Ok(())
    }

    /// Settings for the API client
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            refresh_path: self.refresh_path.clone(),
            max_connections: self.http_max_connections,
            connect_timeout: self.http_connect_timeout,
            request_timeout: self.http_request_timeout,
            ..ClientSettings::new(self.base_url.clone())
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// `<data dir>/hustlehub/session.sqlite3`
fn default_session_db() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("hustlehub").join("session.sqlite3"))
}

fn parse_refresh_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Parse a `key=value` query parameter
fn parse_query_pair(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid query parameter (expected key=value): {}", s))?;
    if key.is_empty() {
        return Err(format!("query parameter has an empty key: {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/hustlehub/session.sqlite3");
        assert!(path.to_string_lossy().contains("hustlehub/session.sqlite3"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_query_pair() {
        assert_eq!(
            parse_query_pair("category=design").unwrap(),
            ("category".to_string(), "design".to_string())
        );
        assert_eq!(
            parse_query_pair("search=a=b").unwrap(),
            ("search".to_string(), "a=b".to_string())
        );
        assert!(parse_query_pair("novalue").is_err());
        assert!(parse_query_pair("=x").is_err());
    }

    #[test]
    fn test_parse_refresh_timeout() {
        assert_eq!(parse_refresh_timeout(0), None);
        assert_eq!(parse_refresh_timeout(15), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_cli_get_with_queries() {
        let args = parse(&[
            "hustle",
            "--base-url",
            "http://api.test/api/",
            "-d",
            "/tmp/session.sqlite3",
            "get",
            "/jobs/",
            "-q",
            "page=2",
            "-q",
            "category=design",
        ]);

        assert_eq!(
            args.command,
            Command::Get {
                path: "/jobs/".to_string(),
                query: vec![
                    ("page".to_string(), "2".to_string()),
                    ("category".to_string(), "design".to_string()),
                ],
            }
        );

        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.base_url, "http://api.test/api");
        assert_eq!(config.session_db, PathBuf::from("/tmp/session.sqlite3"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let args = parse(&[
            "hustle",
            "--base-url",
            "ftp://api.test",
            "-d",
            "/tmp/s.sqlite3",
            "status",
        ]);
        let config = Config::from_args(&args).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: HUSTLEHUB_API_URL must use http or https, got: ftp"
        );
    }

    #[test]
    fn test_validate_rejects_relative_refresh_path() {
        let args = parse(&["hustle", "-d", "/tmp/s.sqlite3", "status"]);
        let mut config = Config::from_args(&args).unwrap();
        config.refresh_path = "token/refresh/".to_string();

        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_client_settings_from_config() {
        let args = parse(&[
            "hustle",
            "--base-url",
            "http://api.test/api",
            "-d",
            "/tmp/s.sqlite3",
            "--http-timeout",
            "5",
            "me",
        ]);
        let settings = Config::from_args(&args).unwrap().client_settings();
        assert_eq!(settings.base_url, "http://api.test/api");
        assert_eq!(settings.request_timeout, 5);
        assert_eq!(settings.login_path, "/auth/login/");
        assert_eq!(settings.me_path, "/users/me/");
    }
}
