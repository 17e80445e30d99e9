use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::config::GatewayConfig;
use crate::connector::{Connector, IceServer, SessionInfo, to_websocket_url};
use crate::errors::StreamError;

/// Envelope used by every gateway endpoint.
#[derive(Debug, Deserialize)]
struct GatewayResponse<T> {
    status: Option<String>,
    metadata: Option<T>,
    error: Option<String>,
    error_msg: Option<String>,
}

impl<T> GatewayResponse<T> {
    fn error_message(&self) -> Option<String> {
        self.error_msg.clone().or_else(|| self.error.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SessionMetadata {
    id: String,
    url: String,
    #[serde(default)]
    stun_servers: Vec<GatewayIceServer>,
}

#[derive(Debug, Deserialize)]
struct GatewayIceServer {
    urls: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Requested display parameters for a new session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub density: u32,
}

impl Default for ScreenSpec {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            density: 240,
        }
    }
}

/// Body of `POST /1.0/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRequest {
    pub app: String,
    pub screen: ScreenSpec,
}

impl SessionRequest {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            screen: ScreenSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Thin client for the stream gateway REST API.
#[derive(Clone)]
pub struct GatewayApi {
    base_url: Url,
    token: String,
    client: reqwest::Client,
}

impl GatewayApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self, StreamError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StreamError::Config(format!("invalid gateway url '{base_url}': {e}")))?;
        Ok(Self {
            base_url,
            token: token.to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Build from `gateway-url` / `gateway-token`; refuses when either is missing.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, StreamError> {
        match (config.gateway_url(), config.gateway_token()) {
            (Some(url), Some(token)) => Self::new(&url, &token),
            _ => Err(StreamError::Connector("no gateway connected".into())),
        }
    }

    fn authorization(&self) -> String {
        format!("macaroon root={}", self.token)
    }

    /// Append `path` to the base URL, keeping any path prefix the gateway
    /// is mounted under.
    fn endpoint(&self, path: &str) -> Result<Url, StreamError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| StreamError::Config(format!("invalid gateway path '{path}': {e}")))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, StreamError> {
        let url = self.endpoint(path)?;
        tracing::debug!("gateway request: {method} {url}");

        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, self.authorization());
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StreamError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StreamError::Http(e.to_string()))?;

        let parsed: Option<GatewayResponse<T>> = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&text).ok()
        };

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|p| p.error_message())
                .unwrap_or_else(|| format!("gateway returned status {status}"));
            return Err(StreamError::Connector(detail));
        }

        match parsed {
            Some(resp) if resp.status.as_deref() == Some("error") => Err(StreamError::Connector(
                resp.error_message().unwrap_or_else(|| "gateway error".into()),
            )),
            Some(resp) => Ok(resp.metadata),
            None => Ok(None),
        }
    }

    pub async fn create_session(&self, request: &SessionRequest) -> Result<SessionInfo, StreamError> {
        let body = serde_json::to_value(request)
            .map_err(|e| StreamError::Protocol(format!("encode session request: {e}")))?;
        let metadata: Option<SessionMetadata> = self
            .request(reqwest::Method::POST, "/1.0/sessions", Some(body))
            .await?;
        let metadata = metadata
            .ok_or_else(|| StreamError::Connector("gateway returned no session metadata".into()))?;
        Ok(session_info_from(metadata))
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), StreamError> {
        let path = format!("/1.0/sessions/{}", urlencoding::encode(id));
        let _: Option<serde_json::Value> =
            self.request(reqwest::Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn list_applications(&self) -> Result<Vec<ApplicationInfo>, StreamError> {
        let apps: Option<Vec<ApplicationInfo>> = self
            .request(reqwest::Method::GET, "/1.0/applications/", None)
            .await?;
        Ok(apps.unwrap_or_default())
    }
}

fn session_info_from(metadata: SessionMetadata) -> SessionInfo {
    SessionInfo {
        id: metadata.id,
        signaling_url: to_websocket_url(&metadata.url),
        ice_servers: metadata
            .stun_servers
            .into_iter()
            .map(|s| IceServer {
                urls: s.urls,
                username: s.username.filter(|u| !u.is_empty()),
                credential: s.password.filter(|p| !p.is_empty()),
            })
            .collect(),
    }
}

/// [`Connector`] that creates a fresh session through the gateway and
/// deletes it again on disconnect.
pub struct GatewayConnector {
    api: GatewayApi,
    request: SessionRequest,
    session_id: Mutex<Option<String>>,
}

impl GatewayConnector {
    pub fn new(api: GatewayApi, request: SessionRequest) -> Self {
        Self {
            api,
            request,
            session_id: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for GatewayConnector {
    async fn connect(&self) -> Result<SessionInfo, StreamError> {
        tracing::info!("creating session for app '{}'", self.request.app);
        let info = self.api.create_session(&self.request).await?;
        *self.session_id.lock().await = Some(info.id.clone());
        tracing::info!("gateway session created: {}", info.id);
        Ok(info)
    }

    async fn disconnect(&self) {
        let id = self.session_id.lock().await.take();
        if let Some(id) = id {
            if let Err(e) = self.api.delete_session(&id).await {
                tracing::warn!("failed to delete gateway session {id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_maps_to_session_info() {
        let json = r#"{
            "status": "success",
            "metadata": {
                "id": "c0ffee",
                "url": "https://gw.example.com/1.0/sessions/c0ffee/sockets/client",
                "stun_servers": [
                    {"urls": ["stun:stun.example.com:3478"], "username": "", "password": ""},
                    {"urls": ["turn:turn.example.com"], "username": "u", "password": "p"}
                ]
            }
        }"#;
        let resp: GatewayResponse<SessionMetadata> = serde_json::from_str(json).unwrap();
        let info = session_info_from(resp.metadata.unwrap());

        assert_eq!(info.id, "c0ffee");
        assert_eq!(
            info.signaling_url,
            "wss://gw.example.com/1.0/sessions/c0ffee/sockets/client"
        );
        assert_eq!(info.ice_servers.len(), 2);
        assert_eq!(info.ice_servers[0].username, None);
        assert_eq!(info.ice_servers[1].credential.as_deref(), Some("p"));
    }

    #[test]
    fn error_envelope_prefers_error_msg() {
        let resp: GatewayResponse<SessionMetadata> =
            serde_json::from_str(r#"{"error_msg": "no gateway connected"}"#).unwrap();
        assert_eq!(resp.error_message().as_deref(), Some("no gateway connected"));
    }

    #[test]
    fn session_request_body() {
        let body = serde_json::to_value(SessionRequest::new("android-game")).unwrap();
        assert_eq!(body["app"], "android-game");
        assert_eq!(body["screen"]["width"], 1280);
        assert_eq!(body["screen"]["fps"], 30);
    }

    #[test]
    fn authorization_uses_macaroon_scheme() {
        let api = GatewayApi::new("https://gw.example.com", "tok").unwrap();
        assert_eq!(api.authorization(), "macaroon root=tok");
        assert_eq!(
            api.endpoint("/1.0/sessions").unwrap().as_str(),
            "https://gw.example.com/1.0/sessions"
        );
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let api = GatewayApi::new("https://gw.example.com/gateway", "tok").unwrap();
        assert_eq!(
            api.endpoint("/1.0/sessions").unwrap().as_str(),
            "https://gw.example.com/gateway/1.0/sessions"
        );

        let api = GatewayApi::new("https://gw.example.com/gateway/", "tok").unwrap();
        assert_eq!(
            api.endpoint("/1.0/applications/").unwrap().as_str(),
            "https://gw.example.com/gateway/1.0/applications/"
        );
    }

    #[test]
    fn from_config_requires_both_keys() {
        let cfg = GatewayConfig::from_yaml("gateway-url: https://gw.example.com\n").unwrap();
        assert!(matches!(
            GatewayApi::from_config(&cfg),
            Err(StreamError::Connector(msg)) if msg == "no gateway connected"
        ));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        assert!(matches!(
            GatewayApi::new("not a url", "tok"),
            Err(StreamError::Config(_))
        ));
    }
}
