// Token refresh exchange

use reqwest::{Client, StatusCode};

use super::types::{RefreshRequest, RefreshResponse, Tokens};
use crate::error::SessionInvalidReason;

/// Trade a refresh token for a new access token
///
/// Sent without an Authorization header. Every failure is terminal for the
/// session, a 401 from the endpoint is reported as
/// [`SessionInvalidReason::RefreshRejected`].
pub async fn exchange(
    client: &Client,
    url: &str,
    refresh_token: &str,
) -> Result<Tokens, SessionInvalidReason> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh: refresh_token,
        })
        .send()
        .await
        .map_err(|e| {
            SessionInvalidReason::RefreshFailed(format!("failed to send refresh request: {}", e))
        })?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %error_text, "Refresh token rejected");
        return Err(SessionInvalidReason::RefreshRejected);
    }
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %error_text, "Refresh request failed");
        return Err(SessionInvalidReason::RefreshFailed(format!(
            "{} - {}",
            status, error_text
        )));
    }

    let data: RefreshResponse = response.json().await.map_err(|e| {
        SessionInvalidReason::RefreshFailed(format!("failed to parse refresh response: {}", e))
    })?;

    if data.access.is_empty() {
        return Err(SessionInvalidReason::RefreshFailed(
            "refresh response does not contain an access token".to_string(),
        ));
    }

    Ok(Tokens {
        access: data.access,
        refresh: data.refresh,
    })
}
