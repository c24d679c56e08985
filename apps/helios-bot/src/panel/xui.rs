use super::{build_vless_uri, CreateCredential, PanelApi, PanelError};
use crate::config::ServerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const FLOW: &str = "xtls-rprx-vision";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a 3x-ui style panel. Each operation logs in with a
/// fresh cookie session that is dropped when the call returns.
pub struct XuiPanel {
    username: String,
    password: String,
}

/// One authenticated cookie session against one server, alive for a
/// single panel operation.
struct PanelSession {
    http: reqwest::Client,
    base: String,
}

impl PanelSession {
    fn api(&self, path: &str) -> String {
        format!("{}/panel/api/inbounds/{}", self.base, path)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientSettings<'a> {
    id: &'a str,
    alter_id: i64,
    email: &'a str,
    limit_ip: i64,
    #[serde(rename = "totalGB")]
    total_gb: i64,
    expiry_time: i64,
    enable: bool,
    tg_id: String,
    sub_id: &'a str,
    flow: &'a str,
}

impl XuiPanel {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// POST {base}/login/ with admin credentials; the session cookie
    /// lands in this session's private cookie store.
    async fn login(&self, server: &ServerConfig) -> Result<PanelSession, PanelError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(CALL_TIMEOUT)
            .build()?;

        let response = http
            .post(format!("{}/login/", server.api_url))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PanelError::Auth(response.status().as_u16()));
        }

        Ok(PanelSession {
            http,
            base: server.api_url.clone(),
        })
    }

    /// The panel wraps client definitions in a double-encoded settings
    /// envelope on inbound 1.
    fn client_envelope(credential: &ClientSettings<'_>) -> Result<serde_json::Value, PanelError> {
        let settings = serde_json::to_string(&json!({ "clients": [credential] }))
            .map_err(|e| PanelError::Api(e.to_string()))?;
        Ok(json!({ "id": 1, "settings": settings }))
    }

    async fn current_expiry(
        &self,
        session: &PanelSession,
        email: &str,
    ) -> Result<i64, PanelError> {
        let response = session
            .http
            .get(session.api(&format!("getClientTraffics/{}", email)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PanelError::Api(format!(
                "getClientTraffics returned {}",
                response.status()
            )));
        }
        let body: ApiResponse = response.json().await?;
        Ok(body
            .obj
            .get("expiryTime")
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }
}

#[async_trait]
impl PanelApi for XuiPanel {
    async fn create_credential(
        &self,
        server: &ServerConfig,
        credential: &CreateCredential,
    ) -> Result<(), PanelError> {
        let session = self.login(server).await?;
        let tg_id = credential.tg_id.to_string();
        let client = ClientSettings {
            id: &credential.client_id,
            alter_id: 0,
            email: &credential.email,
            limit_ip: credential.limit_ip,
            total_gb: 0,
            expiry_time: credential.expiry_time,
            enable: true,
            tg_id,
            sub_id: &credential.email,
            flow: FLOW,
        };

        let response = session
            .http
            .post(session.api("addClient"))
            .json(&Self::client_envelope(&client)?)
            .send()
            .await?;
        let status = response.status();
        let body: ApiResponse = response.json().await?;

        if !status.is_success() || !body.success {
            if body.msg.contains("Duplicate email") {
                return Err(PanelError::DuplicateEmail);
            }
            return Err(PanelError::Api(format!("addClient failed: {}", body.msg)));
        }
        debug!(email = %credential.email, "Panel credential created");
        Ok(())
    }

    async fn renew_credential(
        &self,
        server: &ServerConfig,
        tg_id: i64,
        client_id: &str,
        email: &str,
        new_expiry_time: i64,
    ) -> Result<(), PanelError> {
        let session = self.login(server).await?;

        // The panel may hold a later expiry than the registry does (an
        // operator edit); never shorten it.
        let live_expiry = self.current_expiry(&session, email).await?;
        let updated_expiry = live_expiry.max(new_expiry_time);

        let tg_id = tg_id.to_string();
        let client = ClientSettings {
            id: client_id,
            alter_id: 0,
            email,
            limit_ip: 2,
            total_gb: 0,
            expiry_time: updated_expiry,
            enable: true,
            tg_id,
            sub_id: email,
            flow: FLOW,
        };

        let response = session
            .http
            .post(session.api(&format!("updateClient/{}", client_id)))
            .json(&Self::client_envelope(&client)?)
            .send()
            .await?;
        let status = response.status();
        let body: ApiResponse = response.json().await?;

        if !status.is_success() || !body.success {
            warn!(client_id, msg = %body.msg, "Panel renew refused");
            return Err(PanelError::Api(format!("updateClient failed: {}", body.msg)));
        }
        Ok(())
    }

    async fn delete_credential(
        &self,
        server: &ServerConfig,
        client_id: &str,
    ) -> Result<(), PanelError> {
        let session = self.login(server).await?;
        let response = session
            .http
            .post(session.api(&format!("1/delClient/{}", client_id)))
            .send()
            .await?;
        let status = response.status();
        let body: ApiResponse = response.json().await?;

        if !status.is_success() || !body.success {
            return Err(PanelError::Api(format!("delClient failed: {}", body.msg)));
        }
        Ok(())
    }

    async fn connection_uri(
        &self,
        server: &ServerConfig,
        client_id: &str,
        email: &str,
    ) -> Result<String, PanelError> {
        let session = self.login(server).await?;
        let response = session.http.get(session.api("list/")).send().await?;
        if !response.status().is_success() {
            return Err(PanelError::Api(format!(
                "inbound list returned {}",
                response.status()
            )));
        }
        let body: ApiResponse = response.json().await?;

        let inbound = body
            .obj
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| PanelError::Api("panel returned no inbounds".into()))?;

        // streamSettings is a JSON string embedded in the inbound row.
        let stream: serde_json::Value = inbound
            .get("streamSettings")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        let network = stream.get("network").and_then(|v| v.as_str()).unwrap_or("tcp");
        let security = stream
            .get("security")
            .and_then(|v| v.as_str())
            .unwrap_or("reality");
        let flow = stream.get("flow").and_then(|v| v.as_str()).unwrap_or(FLOW);

        Ok(build_vless_uri(server, client_id, email, network, security, flow))
    }
}
