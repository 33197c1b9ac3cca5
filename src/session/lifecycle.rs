use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, VoiceError};

/// Characters the voice service is known to offer
pub const KNOWN_CHARACTERS: &[&str] = &["Miles", "Maya"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A server-side session as returned by create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub character: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    character: &'a str,
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct CharactersResponse {
    characters: Vec<String>,
}

/// Session create/destroy contract of the voice service
#[async_trait::async_trait]
pub trait SessionApi: Send + Sync {
    async fn create(&self, character: &str) -> Result<SessionInfo>;

    async fn destroy(&self, session_id: &str) -> Result<()>;

    async fn characters(&self) -> Result<Vec<String>>;

    /// Websocket address of a session's channel
    fn channel_url(&self, session_id: &str) -> String;
}

/// `SessionApi` over the service's REST endpoints
pub struct HttpSessionApi {
    client: Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VoiceError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl SessionApi for HttpSessionApi {
    async fn create(&self, character: &str) -> Result<SessionInfo> {
        if !KNOWN_CHARACTERS.contains(&character) {
            warn!("Unknown character '{}', passing it through", character);
        }

        let url = format!("{}/api/sessions", self.base_url);
        info!("Creating session for {} at {}", character, url);

        let response = self
            .client
            .post(&url)
            .json(&CreateRequest { character })
            .send()
            .await
            .map_err(|e| VoiceError::SessionCreate(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::SessionCreate(format!("{}: {}", status, body)));
        }

        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| VoiceError::SessionCreate(format!("malformed response: {}", e)))?;

        info!("Session {} created", info.session_id);
        Ok(info)
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/api/sessions/{}", self.base_url, session_id);
        debug!("Destroying session at {}", url);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| VoiceError::network(format!("destroy request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoiceError::network(format!(
                "destroy returned {}",
                response.status()
            )));
        }

        match response.json::<DestroyResponse>().await {
            Ok(body) if !body.success => {
                warn!("Service reported session {} was not active", session_id)
            }
            Ok(_) => info!("Session {} destroyed", session_id),
            Err(e) => debug!("Unreadable destroy response: {}", e),
        }
        Ok(())
    }

    async fn characters(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/characters", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VoiceError::network(format!("characters request failed: {}", e)))?;

        let body: CharactersResponse = response
            .error_for_status()
            .map_err(|e| VoiceError::network(e.to_string()))?
            .json()
            .await
            .map_err(|e| VoiceError::network(format!("malformed characters response: {}", e)))?;
        Ok(body.characters)
    }

    fn channel_url(&self, session_id: &str) -> String {
        channel_url(&self.base_url, session_id)
    }
}

/// `https` services get `wss`, anything else `ws`
pub fn channel_url(base_url: &str, session_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        ("ws", rest)
    } else {
        ("ws", base)
    };
    format!("{}://{}/ws/{}", scheme, rest, session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_url_mirrors_scheme() {
        assert_eq!(
            channel_url("http://localhost:5000", "abc"),
            "ws://localhost:5000/ws/abc"
        );
        assert_eq!(
            channel_url("https://voice.example.com/", "abc"),
            "wss://voice.example.com/ws/abc"
        );
        assert_eq!(channel_url("127.0.0.1:5000", "x"), "ws://127.0.0.1:5000/ws/x");
    }

    #[test]
    fn test_session_info_shape() {
        let info: SessionInfo =
            serde_json::from_str(r#"{"session_id":"s-1","character":"Maya"}"#).unwrap();
        assert_eq!(info.session_id, "s-1");
        assert_eq!(info.character, "Maya");
    }
}
