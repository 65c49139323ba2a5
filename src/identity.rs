//! Client for the remote identity service.
//!
//! Every call posts a form with an `action` field to `<base>api.php` and gets
//! back `{"status": ..., "message": ..., "data": ...}`. Only
//! `status == "success"` counts as success; anything else is surfaced with
//! the service's own message. There are no retries.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IdentityResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Fields the core needs from a successful login.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub user_id: String,
    pub token: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    endpoint: String,
}

impl IdentityClient {
    pub fn new(base_url: &str) -> Self {
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}api.php", base),
        }
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<IdentityResponse> {
        self.call(&[
            ("action", "register"),
            ("username", username),
            ("email", email),
            ("password", password),
        ])
        .await
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<LoginSession> {
        let response = self
            .call(&[
                ("action", "login"),
                ("identifier", identifier),
                ("password", password),
            ])
            .await?;
        let data = response.data.unwrap_or(Value::Null);
        let user_id = match data.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(Error::UpstreamUnavailable(
                    "login response is missing a user id".into(),
                ))
            }
        };
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(LoginSession {
            user_id,
            token,
            data,
        })
    }

    pub async fn get_user_info(&self, token: &str) -> Result<IdentityResponse> {
        self.call(&[("action", "get_user"), ("token", token)]).await
    }

    async fn call(&self, form: &[(&str, &str)]) -> Result<IdentityResponse> {
        debug!(endpoint = %self.endpoint, action = form[0].1, "Calling identity service");
        let response: IdentityResponse = self
            .http
            .post(&self.endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        if response.is_success() {
            Ok(response)
        } else {
            Err(Error::UpstreamUnavailable(
                response
                    .message
                    .unwrap_or_else(|| format!("identity service returned {}", response.status)),
            ))
        }
    }
}
