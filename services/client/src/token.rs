//! Session Credential Client
//!
//! A single request/response exchange with the token endpoint. There are no
//! retries: a failure is handed straight back to the caller.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Token endpoint unreachable: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Token endpoint returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Token endpoint rejected the request: {0}")]
    Rejected(String),
    #[error("Malformed credential response: {0}")]
    Malformed(String),
}

/// Everything needed to join a room.
#[derive(Debug)]
pub struct Credential {
    pub room_url: String,
    pub token: SecretString,
    pub room_name: String,
}

/// Fetches a credential for a session, optionally scoped to an agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn fetch_credential(&self, agent_id: Option<String>)
    -> Result<Credential, CredentialError>;
}

/// Wire shape of the endpoint's answer. Field aliases cover the endpoint's
/// short names (`url`, `room`) and the JSON-RPC `result` envelope.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct CredentialPayload {
    #[serde(default, alias = "url")]
    room_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, alias = "room")]
    room_name: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Option<Box<CredentialPayload>>,
}

/// Pulls a readable message out of an `error` field, which may be a string or
/// a JSON-RPC error object.
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("data")
            .and_then(|d| d.get("message"))
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, CredentialError> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CredentialError::Malformed(format!("missing field `{name}`")))
}

/// Interprets a token endpoint response.
pub fn parse_credential(status: u16, body: &str) -> Result<Credential, CredentialError> {
    let parsed = serde_json::from_str::<CredentialPayload>(body);

    if !(200..300).contains(&status) {
        let message = parsed
            .ok()
            .and_then(|p| p.error.as_ref().map(error_message))
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(CredentialError::Status { status, message });
    }

    let mut payload = parsed.map_err(|e| CredentialError::Malformed(e.to_string()))?;
    if let Some(error) = payload.error.as_ref() {
        return Err(CredentialError::Rejected(error_message(error)));
    }
    if let Some(inner) = payload.result.take() {
        payload = *inner;
        if let Some(error) = payload.error.as_ref() {
            return Err(CredentialError::Rejected(error_message(error)));
        }
    }

    let room_url = required(payload.room_url, "roomUrl")?
        .trim_end_matches('/')
        .to_string();
    let token = required(payload.token, "token")?;
    let room_name = required(payload.room_name, "roomName")?;

    Ok(Credential {
        room_url,
        token: SecretString::from(token),
        room_name,
    })
}

/// `TokenClient` backed by an HTTP POST to the token endpoint.
pub struct HttpTokenClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTokenClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    async fn fetch_credential(
        &self,
        agent_id: Option<String>,
    ) -> Result<Credential, CredentialError> {
        let mut params = serde_json::Map::new();
        if let Some(agent_id) = agent_id {
            params.insert("agent_id".to_string(), Value::String(agent_id));
        }
        let request = json!({ "jsonrpc": "2.0", "method": "call", "params": params });

        debug!(endpoint = %self.endpoint, "Requesting session credential");
        let response = self.http.post(&self.endpoint).json(&request).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        match parse_credential(status, &body) {
            Ok(credential) => {
                info!(room = %credential.room_name, url = %credential.room_url, "Session credential issued");
                Ok(credential)
            }
            Err(e) => {
                warn!(error = %e, "Credential request failed");
                Err(e)
            }
        }
    }
}
