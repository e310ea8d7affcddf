use super::Provider;
use crate::error::{DemError, Result};
use crate::remote::{Grant, IdentityService};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    /// Seconds
    expires_in: Option<u64>,
}

impl From<TokenResponse> for Grant {
    fn from(response: TokenResponse) -> Self {
        Grant {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in: Duration::from_secs(response.expires_in.unwrap_or_default()),
        }
    }
}

#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

impl IdentityService for Provider {
    async fn request_token(&self, identity: &str, secret: &str) -> Result<Grant> {
        let form = [
            ("client_id", self.endpoints.client_id.as_str()),
            ("username", identity),
            ("password", secret),
            ("grant_type", "password"),
        ];
        self.token_request(&form, "Access token creation").await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<Grant> {
        let form = [
            ("client_id", self.endpoints.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form, "Access token refresh").await
    }
}

impl Provider {
    async fn token_request(&self, form: &[(&str, &str)], what: &str) -> Result<Grant> {
        let response = self
            .client
            .post(&self.endpoints.identity)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            Ok(body.into())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(token_failure(status, &body, what))
        }
    }
}

/// The identity provider answers bad credentials with 400/401 and an OAuth
/// error document.
fn token_failure(status: StatusCode, body: &str, what: &str) -> DemError {
    let detail = serde_json::from_str::<TokenErrorResponse>(body)
        .map(|e| e.error_description.unwrap_or(e.error))
        .unwrap_or_else(|_| status.to_string());

    match status.as_u16() {
        400 | 401 | 403 => DemError::AuthRejected(format!("{what} failed: {detail}")),
        _ => DemError::from_status(status, what),
    }
}
