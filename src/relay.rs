//! Authenticated relay client
//!
//! Request/response and streaming access to the zero-knowledge relay. Every
//! POST carries `{handle, timestamp, signature}` headers where the signature
//! covers `timestamp ":" body`; every GET (and the websocket upgrade) signs
//! `"GET:" path ":" timestamp`. The relay never sees plaintext except inside
//! a guardrail scan request, which it verifies against the prior hash
//! commitment.

use crate::crypto::{self, KeyMaterial};
use crate::error::{RelayError, Result};
use crate::types::{HandleInfo, InboxResponse, MessageEnvelope, RelayEvent, TokenAction};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Deadline for control-plane calls.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for guardrail scan calls.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Inbox poll period when the streaming session is unavailable.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Relay operations the pipeline consumes. Fronted by a trait so the
/// pipeline, guardrail, and router run against a mock in tests.
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Fetch the inbox, optionally only entries after a cursor id.
    async fn fetch_inbox(&self, after: Option<&str>) -> Result<Vec<MessageEnvelope>>;

    /// Fetch public handle metadata (signing key lookup).
    async fn handle_info(&self, peer: &str) -> Result<HandleInfo>;

    /// Acknowledge processed envelope ids. Best-effort: a 4xx is logged
    /// and swallowed, never fatal.
    async fn ack(&self, ids: &[String]) -> Result<()>;

    /// Announce a self-restriction intent for a handle.
    async fn set_self_read(&self, handle: &str, level: &str) -> Result<()>;

    /// Mint a one-shot trust/untrust/block/forward URL for human buttons.
    async fn mint_trust_token(
        &self,
        target: &str,
        action: TokenAction,
        message_id: Option<&str>,
    ) -> Result<String>;

    /// Relay-mediated guardrail scan. `Ok(flagged)`; any transport or
    /// status failure is an error the scanner maps to "unavailable".
    async fn scan_message(&self, message_id: &str, text: &str) -> Result<bool>;
}

/// HTTP + websocket client for one relay and one local handle.
pub struct RelayClient {
    http: reqwest::Client,
    scan_http: reqwest::Client,
    base: Url,
    handle: String,
    keys: Arc<KeyMaterial>,
}

impl RelayClient {
    pub fn new(relay: &str, handle: &str, keys: Arc<KeyMaterial>) -> Result<Self> {
        let base = Url::parse(relay)?;
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Request(e.to_string()))?;
        let scan_http = reqwest::Client::builder()
            .timeout(SCAN_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Request(e.to_string()))?;
        Ok(Self {
            http,
            scan_http,
            base,
            handle: handle.to_string(),
            keys,
        })
    }

    fn timestamp() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }

    /// Auth headers for a POST: the signature covers `timestamp ":" body`.
    fn post_auth(&self, body: &str) -> (String, String) {
        let timestamp = Self::timestamp();
        let signature = self.keys.sign(&crypto::post_auth_payload(&timestamp, body));
        (timestamp, signature)
    }

    /// Auth headers for a GET or upgrade: the signature covers
    /// `"GET:" path ":" timestamp` where path includes the query string.
    fn get_auth(&self, path_and_query: &str) -> (String, String) {
        let timestamp = Self::timestamp();
        let signature = self
            .keys
            .sign(&crypto::get_auth_payload(path_and_query, &timestamp));
        (timestamp, signature)
    }

    async fn signed_get(&self, path_and_query: &str) -> Result<reqwest::Response> {
        let url = self.base.join(path_and_query)?;
        let (timestamp, signature) = self.get_auth(path_and_query);
        let response = self
            .http
            .get(url)
            .header("handle", &self.handle)
            .header("timestamp", timestamp)
            .header("signature", signature)
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn signed_post(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = self.base.join(path)?;
        let body_text = serde_json::to_string(body)?;
        let (timestamp, signature) = self.post_auth(&body_text);
        let response = client
            .post(url)
            .header("handle", &self.handle)
            .header("timestamp", timestamp)
            .header("signature", signature)
            .header("content-type", "application/json")
            .body(body_text)
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RelayError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        }
        .into())
    }

    /// Open the streaming session at `/ws/{handle}`, authenticated with the
    /// GET-form headers on the upgrade request.
    pub async fn connect_stream(&self) -> Result<WsSession> {
        let path = format!("/ws/{}", self.handle);
        let mut ws_url = self.base.join(&path)?;
        let scheme = match ws_url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| RelayError::StreamingUnavailable("relay URL has no ws form".into()))?;

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::StreamingUnavailable(e.to_string()))?;
        let (timestamp, signature) = self.get_auth(&path);
        let headers = request.headers_mut();
        headers.insert("handle", header_value(&self.handle)?);
        headers.insert("timestamp", header_value(&timestamp)?);
        headers.insert("signature", header_value(&signature)?);

        let connected = tokio::time::timeout(CONTROL_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| RelayError::Timeout)?;
        match connected {
            Ok((stream, _)) => {
                debug!("Streaming session established at {ws_url}");
                Ok(WsSession { stream })
            }
            // A relay that answers the upgrade with 404/501 has no streaming
            // endpoint at all; the daemon falls back to polling. Anything
            // else is transient and goes through reconnect backoff.
            Err(WsError::Http(response))
                if matches!(response.status().as_u16(), 404 | 501) =>
            {
                Err(RelayError::StreamingUnavailable(format!(
                    "upgrade rejected with HTTP {}",
                    response.status()
                ))
                .into())
            }
            Err(WsError::Url(e)) => Err(RelayError::StreamingUnavailable(e.to_string()).into()),
            Err(e) => Err(RelayError::Request(e.to_string()).into()),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| RelayError::Request(e.to_string()).into())
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn fetch_inbox(&self, after: Option<&str>) -> Result<Vec<MessageEnvelope>> {
        let path = match after {
            Some(cursor) => format!("/inbox/{}?after={cursor}", self.handle),
            None => format!("/inbox/{}", self.handle),
        };
        let response = self.signed_get(&path).await?;
        let inbox: InboxResponse = response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        Ok(inbox.messages)
    }

    async fn handle_info(&self, peer: &str) -> Result<HandleInfo> {
        let response = self.signed_get(&format!("/handle/info/{peer}")).await?;
        response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()).into())
    }

    async fn ack(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "ids": ids });
        match self.signed_post(&self.http, "/inbox/ack", &body).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Whether the relay tolerates unknown ids is undocumented;
                // acks are best-effort.
                warn!("Ack for {} id(s) failed: {e}", ids.len());
                Ok(())
            }
        }
    }

    async fn set_self_read(&self, handle: &str, level: &str) -> Result<()> {
        let body = serde_json::json!({ "handle": handle, "selfRead": level });
        self.signed_post(&self.http, "/handle/self", &body).await?;
        Ok(())
    }

    async fn mint_trust_token(
        &self,
        target: &str,
        action: TokenAction,
        message_id: Option<&str>,
    ) -> Result<String> {
        let mut body = serde_json::json!({
            "target": target,
            "action": action.as_str(),
        });
        if let Some(id) = message_id {
            body["messageId"] = serde_json::Value::String(id.to_string());
        }
        let response = self.signed_post(&self.http, "/trust-token", &body).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        value
            .get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::InvalidResponse("trust-token response without url".into()).into())
    }

    async fn scan_message(&self, message_id: &str, text: &str) -> Result<bool> {
        let body = serde_json::json!({ "message_id": message_id, "text": text });
        let response = self
            .signed_post(&self.scan_http, "/guardrail/scan", &body)
            .await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        Ok(value.get("flagged").and_then(|f| f.as_bool()).unwrap_or(false))
    }
}

/// An open streaming session. Reads server pushes until closed.
pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsSession {
    /// Next relay event, or `None` when the server closed the session.
    /// Unparseable frames are logged and skipped.
    pub async fn next_event(&mut self) -> Result<Option<RelayEvent>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => match RelayEvent::parse(text.as_str()) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => {
                        warn!("Skipping unparseable relay frame: {e}");
                    }
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Err(RelayError::Request(e.to_string()).into());
                    }
                }
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(RelayError::Request(e.to_string()).into()),
            }
        }
        Ok(None)
    }

    /// Close the session with a normal close code.
    pub async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "shutdown".into(),
        };
        if let Err(e) = self.stream.send(Message::Close(Some(frame))).await {
            debug!("Close frame send failed (session already gone): {e}");
        }
    }
}

/// Scriptable in-memory relay for pipeline, guardrail, and router tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRelay {
        inbox_responses: Mutex<VecDeque<Vec<MessageEnvelope>>>,
        infos: Mutex<HashMap<String, HandleInfo>>,
        scan_script: Mutex<VecDeque<std::result::Result<bool, String>>>,
        /// Every batch of ids acked, in order.
        pub acks: Mutex<Vec<Vec<String>>>,
        /// Every `(handle, selfRead)` announcement, in order.
        pub self_reads: Mutex<Vec<(String, String)>>,
        /// Every inbox fetch cursor, in order (`None` = full fetch).
        pub inbox_fetches: Mutex<Vec<Option<String>>>,
    }

    impl MockRelay {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the next `fetch_inbox` response. An empty queue serves an
        /// empty inbox.
        pub fn script_inbox(&self, messages: Vec<MessageEnvelope>) {
            self.inbox_responses.lock().unwrap().push_back(messages);
        }

        /// Queue the next `scan_message` result. An empty queue scans clean.
        pub fn script_scan(&self, result: std::result::Result<bool, String>) {
            self.scan_script.lock().unwrap().push_back(result);
        }

        pub fn put_info(&self, peer: &str, info: HandleInfo) {
            self.infos.lock().unwrap().insert(peer.to_string(), info);
        }
    }

    #[async_trait]
    impl RelayApi for MockRelay {
        async fn fetch_inbox(&self, after: Option<&str>) -> Result<Vec<MessageEnvelope>> {
            self.inbox_fetches
                .lock()
                .unwrap()
                .push(after.map(str::to_string));
            Ok(self
                .inbox_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }

        async fn handle_info(&self, peer: &str) -> Result<HandleInfo> {
            self.infos.lock().unwrap().get(peer).cloned().ok_or_else(|| {
                RelayError::Status {
                    status: 404,
                    body: format!("unknown handle {peer}"),
                }
                .into()
            })
        }

        async fn ack(&self, ids: &[String]) -> Result<()> {
            if ids.is_empty() {
                return Ok(());
            }
            self.acks.lock().unwrap().push(ids.to_vec());
            Ok(())
        }

        async fn set_self_read(&self, handle: &str, level: &str) -> Result<()> {
            self.self_reads
                .lock()
                .unwrap()
                .push((handle.to_string(), level.to_string()));
            Ok(())
        }

        async fn mint_trust_token(
            &self,
            target: &str,
            action: TokenAction,
            message_id: Option<&str>,
        ) -> Result<String> {
            Ok(match message_id {
                Some(id) => format!("https://relay.test/t/{}/{target}/{id}", action.as_str()),
                None => format!("https://relay.test/t/{}/{target}", action.as_str()),
            })
        }

        async fn scan_message(&self, _message_id: &str, _text: &str) -> Result<bool> {
            match self.scan_script.lock().unwrap().pop_front() {
                Some(Ok(flagged)) => Ok(flagged),
                Some(Err(msg)) => Err(RelayError::Request(msg).into()),
                None => Ok(false),
            }
        }
    }
}
