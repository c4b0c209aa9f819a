use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{self, LoginRequest, LoginResponse, RefreshTicket, Session, Tokens};
use crate::config::ClientSettings;
use crate::error::{ClientError, Result, SessionInvalidReason};
use crate::models::{ApiRequest, ApiResponse, CurrentUser};

/// JSON client for the HustleHub API
///
/// Attaches the stored access token to every request. A 401 is recovered
/// once per request: the first failing request refreshes the token, requests
/// failing meanwhile queue behind it, then each replays with the new token.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Credentials, refresh flag and pending queue
    session: Arc<Session>,

    settings: ClientSettings,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(settings: ClientSettings, session: Arc<Session>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(settings.max_connections)
            .connect_timeout(Duration::from_secs(settings.connect_timeout))
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            session,
            settings,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::new(Method::GET, path)).await
    }

    pub async fn get_with_query<K, V>(&self, path: &str, query: &[(K, V)]) -> Result<ApiResponse>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.request(ApiRequest::new(Method::GET, path).with_query(query))
            .await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        let body = to_json(body)?;
        self.request(ApiRequest::new(Method::POST, path).with_body(body))
            .await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        let body = to_json(body)?;
        self.request(ApiRequest::new(Method::PATCH, path).with_body(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::new(Method::DELETE, path)).await
    }

    /// Execute a request, recovering from an expired access token
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let span = tracing::debug_span!(
            "api_request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path,
        );
        self.execute(&request).instrument(span).await
    }

    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let refresh_endpoint = self.is_refresh_path(&request.path);
        let mut recovered: Option<String> = None;

        loop {
            // Read at send time so a replay picks up the refreshed token
            let token = if refresh_endpoint {
                None
            } else {
                self.session.access_token()?.or_else(|| recovered.clone())
            };

            let response = self.send_once(request, token.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Self::into_api_response(response).await;
            }

            if refresh_endpoint {
                tracing::warn!("Refresh endpoint answered 401");
                return Err(self
                    .session
                    .terminate(SessionInvalidReason::RefreshRejected));
            }

            if recovered.is_some() {
                tracing::warn!("Replayed request rejected with 401, not refreshing again");
                return Err(self
                    .session
                    .invalidate(token.as_deref(), SessionInvalidReason::RetryRejected));
            }

            tracing::debug!("Received 401, recovering session");
            recovered = Some(self.recover(token.as_deref()).await?);
        }
    }

    /// Obtain a fresh access token for a request that was sent with `sent`
    async fn recover(&self, sent: Option<&str>) -> Result<String> {
        match self.session.on_unauthorized(sent)? {
            RefreshTicket::Replay(token) => Ok(token),
            RefreshTicket::Wait(waiter) => self.session.await_refresh(waiter).await,
            RefreshTicket::Lead(lease) => {
                let url = join_url(&self.settings.base_url, &self.settings.refresh_path);
                let exchange = auth::exchange(&self.client, &url, lease.refresh_token());

                let outcome = match self.session.refresh_timeout() {
                    Some(limit) => tokio::time::timeout(limit, exchange)
                        .await
                        .unwrap_or_else(|_| {
                            Err(SessionInvalidReason::RefreshFailed(format!(
                                "timed out after {:?}",
                                limit
                            )))
                        }),
                    None => exchange.await,
                };

                match outcome {
                    Ok(tokens) => {
                        let settlement = lease.succeed(tokens)?;
                        tracing::debug!(
                            released = ?settlement.released,
                            "Released pending requests"
                        );
                        Ok(settlement.access)
                    }
                    Err(reason) => {
                        lease.fail(reason.clone());
                        Err(reason.into())
                    }
                }
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response> {
        let url = join_url(&self.settings.base_url, &request.path);
        tracing::debug!(url = %url, authorized = token.is_some(), "Sending HTTP request");

        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        builder.send().await.map_err(|e| {
            let err = ClientError::transport(e);
            tracing::warn!(error = %err, url = %url, "HTTP request error");
            err
        })
    }

    /// Decode the body, turning error statuses into [`ClientError::Api`]
    async fn into_api_response(response: Response) -> Result<ApiResponse> {
        let status = response.status();
        let text = response.text().await.map_err(ClientError::transport)?;

        if status.is_success() {
            let body = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).map_err(|e| {
                    ClientError::Decode(format!("response body is not JSON: {}", e))
                })?
            };
            tracing::debug!(status = %status, "Request successful");
            return Ok(ApiResponse {
                status: status.as_u16(),
                body,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        tracing::warn!(status = %status, body = %body, "Received error response");
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }

    fn is_refresh_path(&self, path: &str) -> bool {
        normalize_path(path) == normalize_path(&self.settings.refresh_path)
    }

    /// Log in with email and password and store the returned tokens
    pub async fn login(&self, email: &str, password: &str) -> Result<Tokens> {
        let request = ApiRequest::new(Method::POST, self.settings.login_path.as_str())
            .with_body(to_json(&LoginRequest { email, password })?);

        // Bad credentials are a plain 401, never a refresh trigger
        let response = self.send_once(&request, None).await?;
        let tokens: Tokens = Self::into_api_response(response)
            .await?
            .json::<LoginResponse>()?
            .into();

        self.session.set_tokens(&tokens)?;
        tracing::info!(email = %email, "Logged in");
        Ok(tokens)
    }

    /// Tell the backend, then forget the stored tokens
    ///
    /// Local credentials are cleared even when the backend call fails. The
    /// session-invalid hook is not fired.
    pub async fn logout(&self) -> Result<()> {
        let token = self.session.access_token()?;

        if token.is_some() {
            let request = ApiRequest::new(Method::POST, self.settings.logout_path.as_str());
            match self.send_once(&request, token.as_deref()).await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Backend session closed");
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "Logout request failed");
                }
                Err(e) => {
                    tracing::warn!("Logout request failed: {}", e);
                }
            }
        }

        self.session.clear_tokens()?;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Profile of the logged-in user
    pub async fn current_user(&self) -> Result<CurrentUser> {
        self.get(&self.settings.me_path).await?.json()
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<Value> {
    serde_json::to_value(body)
        .context("Failed to serialize request body")
        .map_err(ClientError::from)
}

/// Join a base URL and a relative API path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Path without query string or surrounding slashes
fn normalize_path(path: &str) -> &str {
    path.split('?').next().unwrap_or(path).trim_matches('/')
}
