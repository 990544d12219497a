//! Metasploit RPC client
//!
//! Request/response transport against the in-container service plus typed
//! wrappers for the console operations the core consumes. Tokens may expire
//! silently; callers refresh by calling `login` again.

use crate::docker::RpcEndpoint;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc authentication failed: {0}")]
    AuthFailed(String),
    #[error("rpc call failed: {0}")]
    Call(String),
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

/// One read of a remote console.
#[derive(Debug, Clone)]
pub struct ConsoleRead {
    pub data: String,
    pub busy: bool,
    pub prompt: String,
}

/// Result of remote console creation.
#[derive(Debug, Clone)]
pub struct ConsoleCreated {
    pub id: String,
    pub prompt: String,
}

#[async_trait]
pub trait MsfRpc: Send + Sync {
    /// Authenticate and obtain a session token.
    async fn login(&self, endpoint: &RpcEndpoint) -> Result<String, RpcError>;

    /// Raw method call; the typed wrappers below are built on this.
    async fn call(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError>;

    async fn console_create(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
    ) -> Result<ConsoleCreated, RpcError> {
        let resp = self.call(endpoint, token, "console.create", vec![]).await?;
        let id = field_string(&resp, "id")?;
        let prompt = resp
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ConsoleCreated { id, prompt })
    }

    async fn console_destroy(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
        console_id: &str,
    ) -> Result<(), RpcError> {
        let resp = self
            .call(endpoint, token, "console.destroy", vec![json!(console_id)])
            .await?;
        match resp.get("result").and_then(Value::as_str) {
            Some("success") => Ok(()),
            other => Err(RpcError::Call(format!("console.destroy: {other:?}"))),
        }
    }

    async fn console_write(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
        console_id: &str,
        data: &str,
    ) -> Result<u64, RpcError> {
        let resp = self
            .call(
                endpoint,
                token,
                "console.write",
                vec![json!(console_id), json!(data)],
            )
            .await?;
        resp.get("wrote")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::Malformed("console.write: missing wrote".to_string()))
    }

    async fn console_read(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
        console_id: &str,
    ) -> Result<ConsoleRead, RpcError> {
        let resp = self
            .call(endpoint, token, "console.read", vec![json!(console_id)])
            .await?;
        Ok(ConsoleRead {
            data: resp
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            busy: resp.get("busy").and_then(Value::as_bool).unwrap_or(false),
            prompt: resp
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn field_string(value: &Value, key: &str) -> Result<String, RpcError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Malformed(format!("missing field {key}")))
}

/// HTTP implementation. The wire encoding is the provider's concern; the core
/// only sees the operation set above.
pub struct HttpRpcClient {
    http: reqwest::Client,
    user: String,
    password: String,
}

impl HttpRpcClient {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RpcError::Transport(format!("client build: {e}")))?;
        Ok(Self {
            http,
            user: user.into(),
            password: password.into(),
        })
    }

    async fn post(&self, endpoint: &RpcEndpoint, body: Value) -> Result<Value, RpcError> {
        let resp = self
            .http
            .post(endpoint.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(RpcError::Transport(format!("http {status}: {text}")));
        }

        serde_json::from_str(&text).map_err(|e| RpcError::Malformed(format!("{e}: {text}")))
    }
}

#[async_trait]
impl MsfRpc for HttpRpcClient {
    async fn login(&self, endpoint: &RpcEndpoint) -> Result<String, RpcError> {
        let resp = self
            .post(
                endpoint,
                json!({
                    "method": "auth.login",
                    "params": [self.user, self.password],
                }),
            )
            .await?;

        if resp.get("error").and_then(Value::as_bool) == Some(true) {
            let message = resp
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(RpcError::AuthFailed(message.to_string()));
        }
        match resp.get("result").and_then(Value::as_str) {
            Some("success") => field_string(&resp, "token"),
            other => Err(RpcError::AuthFailed(format!("result: {other:?}"))),
        }
    }

    async fn call(
        &self,
        endpoint: &RpcEndpoint,
        token: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let mut params = vec![json!(token)];
        params.extend(args);
        let resp = self
            .post(endpoint, json!({ "method": method, "params": params }))
            .await?;

        if resp.get("error").and_then(Value::as_bool) == Some(true) {
            let message = resp
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(RpcError::Call(format!("{method}: {message}")));
        }
        Ok(resp)
    }
}
