use crate::channel::OutboundChannel;
use async_trait::async_trait;
use convoguard_core::{ConvoError, ConvoResult, OutboundMessage};
use serde::{Deserialize, Serialize};

/// WhatsApp Cloud API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    /// Business phone number id messages are sent from.
    #[serde(default)]
    pub phone_number_id: String,
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Graph API version segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            phone_number_id: String::new(),
            token_env: default_token_env(),
            api_base: default_api_base(),
            api_version: default_api_version(),
        }
    }
}

fn default_token_env() -> String {
    "WHATSAPP_ACCESS_TOKEN".to_string()
}
fn default_api_base() -> String {
    "https://graph.facebook.com".to_string()
}
fn default_api_version() -> String {
    "v19.0".to_string()
}

/// WhatsApp Cloud API outbound adapter.
///
/// Sends plain text messages via `POST /{version}/{phone_number_id}/messages`.
/// Throttling (429), server errors and transport failures are reported as
/// [`ConvoError::UpstreamUnavailable`]; other rejections as
/// [`ConvoError::Channel`].
pub struct WhatsAppChannel {
    endpoint: String,
    access_token: String,
    client: reqwest::Client,
}

// ── WhatsApp API request/response types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: TextBody<'a>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

// ── Implementation ──────────────────────────────────────────────────────────

impl WhatsAppChannel {
    /// Create a channel from configuration and an access token.
    pub fn new(config: &WhatsAppConfig, access_token: impl Into<String>) -> ConvoResult<Self> {
        if config.phone_number_id.trim().is_empty() {
            return Err(ConvoError::Config(
                "whatsapp.phone_number_id must be set".into(),
            ));
        }
        let endpoint = format!(
            "{}/{}/{}/messages",
            config.api_base.trim_end_matches('/'),
            config.api_version,
            config.phone_number_id
        );
        Ok(Self {
            endpoint,
            access_token: access_token.into(),
            client: reqwest::Client::new(),
        })
    }

    /// Create a channel reading the token from `config.token_env`.
    pub fn from_env(config: &WhatsAppConfig) -> ConvoResult<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            ConvoError::Config(format!("environment variable {} is not set", config.token_env))
        })?;
        Self::new(config, token)
    }
}

#[async_trait]
impl OutboundChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, message: &OutboundMessage) -> ConvoResult<()> {
        let request = SendMessageRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: &message.recipient_id,
            kind: "text",
            text: TextBody {
                body: &message.content,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| ConvoError::UpstreamUnavailable(format!("WhatsApp send error: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .json::<ErrorEnvelope>()
            .await
            .map(|env| format!("{} (code {})", env.error.message, env.error.code))
            .unwrap_or_default();

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ConvoError::UpstreamUnavailable(format!(
                "WhatsApp API {status}: {detail}"
            )))
        } else {
            Err(ConvoError::Channel(format!("WhatsApp API {status}: {detail}")))
        }
    }
}
