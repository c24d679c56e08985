pub mod xui;

use crate::config::ServerConfig;
use async_trait::async_trait;
use thiserror::Error;

pub use xui::XuiPanel;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Panel login rejected: halts the operation, nothing to retry with
    /// the same credentials.
    #[error("panel login failed with status {0}")]
    Auth(u16),

    /// The (server, email) pair already exists on the panel; the user
    /// can pick another label.
    #[error("email already registered on panel")]
    DuplicateEmail,

    /// Network-level failure; safe to retry on a later tick.
    #[error("panel unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The panel answered but refused the operation.
    #[error("panel error: {0}")]
    Api(String),
}

#[derive(Debug, Clone)]
pub struct CreateCredential {
    pub client_id: String,
    pub email: String,
    pub tg_id: i64,
    pub expiry_time: i64,
    pub limit_ip: i64,
}

/// Narrow seam over the external VPN panel. Every method performs its
/// own scoped login; no session outlives a call.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn create_credential(
        &self,
        server: &ServerConfig,
        credential: &CreateCredential,
    ) -> Result<(), PanelError>;

    /// Advances the credential on the panel to at least
    /// `new_expiry_time`, reading the live expiry first so the panel is
    /// never shortened either.
    async fn renew_credential(
        &self,
        server: &ServerConfig,
        tg_id: i64,
        client_id: &str,
        email: &str,
        new_expiry_time: i64,
    ) -> Result<(), PanelError>;

    async fn delete_credential(
        &self,
        server: &ServerConfig,
        client_id: &str,
    ) -> Result<(), PanelError>;

    /// Builds the user-facing connection URI from the server's inbound
    /// transport settings.
    async fn connection_uri(
        &self,
        server: &ServerConfig,
        client_id: &str,
        email: &str,
    ) -> Result<String, PanelError>;
}

/// Deterministic VLESS URI for a provisioned client: the same client
/// id, domain and label always produce the same link.
pub fn build_vless_uri(
    server: &ServerConfig,
    client_id: &str,
    email: &str,
    network: &str,
    security: &str,
    flow: &str,
) -> String {
    format!(
        "vless://{}@{}?type={}&security={}&pbk={}&fp=chrome&sni={}&sid={}&spx=%2F&flow={}#{}-{}",
        client_id,
        server.domain,
        network,
        security,
        server.public_key,
        server.sni,
        server.short_id,
        flow,
        server.prefix,
        urlencoding::encode(email),
    )
}

pub fn subscription_url(server: &ServerConfig, email: &str) -> String {
    format!("{}/{}", server.subscription_base, email)
}
