//! 3x-ui panel adapter.
//!
//! Talks to the panel's JSON web API with `reqwest`:
//!
//! - `POST {base}/login` (form) returns a session cookie
//! - `GET {base}/panel/api/inbounds/get/{inbound}` returns the inbound, whose
//!   `settings` and `streamSettings` fields are JSON documents encoded as strings
//! - `POST {base}/panel/api/inbounds/addClient` and
//!   `POST {base}/panel/api/inbounds/updateClient/{client_id}` write clients
//! - `POST {base}/panel/api/inbounds/{inbound}/delClient/{client_id}` removes one
//! - `GET {base}/panel/api/inbounds/getClientTraffics/{email}` reads counters

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use uuid::Uuid;

use super::{
    ClientExpiry, PanelClient, PanelError, PanelSession, ProvisionedClient, RemoteClient,
    TrafficCounters,
};
use crate::models::host::Host;

/// Flow written on every client of a VLESS inbound.
const VLESS_FLOW: &str = "xtls-rprx-vision";

/// The `{ success, msg, obj }` envelope every API call answers with.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Inbound {
    port: u16,
    protocol: String,
    /// JSON document: `{ "clients": [...] }`
    settings: String,
    /// JSON document with network and security settings
    #[serde(default)]
    stream_settings: String,
}

#[derive(Debug, Default, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<XuiClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct XuiClient {
    id: String,
    email: String,
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(default)]
    flow: String,
    #[serde(default)]
    expiry_time: i64,
    #[serde(default, rename = "totalGB")]
    total_gb: i64,
    #[serde(default)]
    limit_ip: i64,
    #[serde(default)]
    sub_id: String,
    #[serde(default)]
    tg_id: serde_json::Value,
    #[serde(default)]
    reset: i64,
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientTraffic {
    #[serde(default)]
    up: i64,
    #[serde(default)]
    down: i64,
    #[serde(default)]
    total: i64,
}

/// Panel client for 3x-ui.
#[derive(Debug, Clone)]
pub struct XuiPanel {
    http: reqwest::Client,
}

impl XuiPanel {
    /// Build the adapter with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Unreachable`] if the HTTP client cannot be built
    /// (for example when no TLS backend is available).
    pub fn new(request_timeout: Duration) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PanelError::Unreachable(format!("HTTP client error: {e}")))?;

        Ok(Self { http })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        session: &PanelSession,
        path: &str,
    ) -> Result<T, PanelError> {
        let request = self.http.get(format!("{}{}", session.base_url, path));
        self.call(session, request).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        session: &PanelSession,
        mut request: reqwest::RequestBuilder,
    ) -> Result<T, PanelError> {
        if let Some(cookie) = &session.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await.map_err(transport_error)?;
        let envelope = response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| PanelError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }

        envelope
            .obj
            .ok_or_else(|| PanelError::Decode("response carried no object".to_string()))
    }

    /// POST a JSON body to a call whose `obj` is null on success.
    async fn post_unit(
        &self,
        session: &PanelSession,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), PanelError> {
        let mut request = self
            .http
            .post(format!("{}{}", session.base_url, path))
            .json(&body);
        if let Some(cookie) = &session.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await.map_err(transport_error)?;
        let envelope = response
            .json::<Envelope<serde_json::Value>>()
            .await
            .map_err(|e| PanelError::Decode(e.to_string()))?;

        if envelope.success {
            Ok(())
        } else {
            Err(PanelError::Rejected(envelope.msg))
        }
    }

    async fn inbound(&self, session: &PanelSession) -> Result<Inbound, PanelError> {
        self.get(session, &format!("/panel/api/inbounds/get/{}", session.inbound_id))
            .await
    }

    async fn clients(&self, session: &PanelSession) -> Result<(Inbound, Vec<XuiClient>), PanelError> {
        let inbound = self.inbound(session).await?;
        let settings: InboundSettings = if inbound.settings.trim().is_empty() {
            InboundSettings::default()
        } else {
            serde_json::from_str(&inbound.settings)
                .map_err(|e| PanelError::Decode(format!("inbound settings: {e}")))?
        };
        Ok((inbound, settings.clients))
    }
}

fn transport_error(error: reqwest::Error) -> PanelError {
    if error.is_timeout() {
        PanelError::Timeout
    } else {
        PanelError::Unreachable(error.to_string())
    }
}

/// Split a host URL into the API base and the hostname clients dial.
fn split_host_url(host_url: &str) -> Result<(String, String), PanelError> {
    let parsed = url::Url::parse(host_url)
        .map_err(|e| PanelError::Unreachable(format!("invalid host url {host_url}: {e}")))?;
    let hostname = parsed
        .host_str()
        .ok_or_else(|| PanelError::Unreachable(format!("host url {host_url} has no hostname")))?
        .to_string();
    Ok((host_url.trim_end_matches('/').to_string(), hostname))
}

/// Render a connection URI for one client of an inbound.
///
/// Only VLESS inbounds are rendered; Reality, TLS and plain security are
/// recognised. Reality clients always dial 443.
fn render_descriptor(
    inbound: &Inbound,
    public_host: &str,
    client_id: &str,
    remark: &str,
) -> Option<String> {
    if !inbound.protocol.eq_ignore_ascii_case("vless") {
        return None;
    }

    let stream: serde_json::Value = serde_json::from_str(&inbound.stream_settings).unwrap_or_default();
    let network = stream["network"].as_str().unwrap_or("tcp");
    let security = stream["security"].as_str().unwrap_or("none");
    let base = format!("vless://{client_id}@{public_host}");

    match security {
        "reality" => {
            let reality = &stream["realitySettings"];
            let public_key = reality["settings"]["publicKey"].as_str()?;
            let fingerprint = reality["settings"]["fingerprint"].as_str().unwrap_or("chrome");
            let server_name = reality["serverNames"].get(0)?.as_str()?;
            let short_id = reality["shortIds"].get(0)?.as_str()?;
            Some(format!(
                "{base}:443?type={network}&encryption=none&security=reality&pbk={public_key}\
                 &fp={fingerprint}&sni={server_name}&sid={short_id}&spx=%2F&flow={VLESS_FLOW}#{remark}"
            ))
        }
        "tls" => {
            let tls = &stream["tlsSettings"];
            let server_name = tls["serverName"].as_str().unwrap_or(public_host);
            let fingerprint = tls["settings"]["fingerprint"].as_str().unwrap_or("chrome");
            Some(format!(
                "{base}:{}?type={network}&encryption=none&security=tls&sni={server_name}&fp={fingerprint}#{remark}",
                inbound.port
            ))
        }
        _ => Some(format!(
            "{base}:{}?type={network}&encryption=none&security=none#{remark}",
            inbound.port
        )),
    }
}

#[async_trait]
impl PanelClient for XuiPanel {
    async fn login(&self, host: &Host) -> Result<PanelSession, PanelError> {
        let (base_url, public_host) = split_host_url(&host.host_url)?;

        let response = self
            .http
            .post(format!("{base_url}/login"))
            .form(&[
                ("username", host.host_username.as_str()),
                ("password", host.host_password.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let envelope = response
            .json::<Envelope<serde_json::Value>>()
            .await
            .map_err(|e| PanelError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(PanelError::Auth(envelope.msg));
        }

        let session = PanelSession {
            host_name: host.host_name.clone(),
            base_url,
            inbound_id: host.inbound_id,
            public_host,
            cookie: (!cookie.is_empty()).then_some(cookie),
        };

        // Resolve the inbound now so a wrong inbound id fails the login
        self.inbound(&session).await?;

        Ok(session)
    }

    async fn list_clients(&self, session: &PanelSession) -> Result<Vec<RemoteClient>, PanelError> {
        let (_, clients) = self.clients(session).await?;

        Ok(clients
            .into_iter()
            .map(|client| RemoteClient {
                client_id: client.id,
                alias: client.email,
                expiry_ms: client.expiry_time,
                enabled: client.enable,
                flow: (!client.flow.is_empty()).then_some(client.flow),
            })
            .collect())
    }

    async fn upsert_client(
        &self,
        session: &PanelSession,
        alias: &str,
        expiry: ClientExpiry,
        owner_id: i64,
    ) -> Result<ProvisionedClient, PanelError> {
        let (inbound, clients) = self.clients(session).await?;
        let now_ms = Utc::now().timestamp_millis();
        let flow = if inbound.protocol.eq_ignore_ascii_case("vless") {
            VLESS_FLOW.to_string()
        } else {
            String::new()
        };

        let existing = clients.into_iter().find(|client| client.email == alias);
        let expiry_ms = expiry.resolve(existing.as_ref().map(|client| client.expiry_time), now_ms);

        let client = match existing {
            Some(mut client) => {
                client.expiry_time = expiry_ms;
                client.enable = true;
                client.flow = flow;
                if client.sub_id.is_empty() {
                    client.sub_id = Uuid::new_v4().simple().to_string()[..16].to_string();
                }
                let body = json!({
                    "id": session.inbound_id,
                    "settings": json!({ "clients": [&client] }).to_string(),
                });
                self.post_unit(
                    session,
                    &format!("/panel/api/inbounds/updateClient/{}", client.id),
                    body,
                )
                .await?;
                client
            }
            None => {
                let client = XuiClient {
                    id: Uuid::new_v4().to_string(),
                    email: alias.to_string(),
                    enable: true,
                    flow,
                    expiry_time: expiry_ms,
                    total_gb: 0,
                    limit_ip: 0,
                    sub_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
                    tg_id: json!(owner_id.to_string()),
                    reset: 0,
                };
                let body = json!({
                    "id": session.inbound_id,
                    "settings": json!({ "clients": [&client] }).to_string(),
                });
                self.post_unit(session, "/panel/api/inbounds/addClient", body)
                    .await?;
                client
            }
        };

        tracing::info!(
            host = %session.host_name,
            alias = %alias,
            expiry_ms,
            "Client written to panel"
        );

        Ok(ProvisionedClient {
            connection_descriptor: render_descriptor(
                &inbound,
                &session.public_host,
                &client.id,
                &session.host_name,
            ),
            client_id: client.id,
            alias: client.email,
            expiry_ms,
        })
    }

    async fn delete_client(&self, session: &PanelSession, alias: &str) -> Result<bool, PanelError> {
        let (_, clients) = self.clients(session).await?;
        let Some(client) = clients.into_iter().find(|client| client.email == alias) else {
            return Ok(false);
        };

        self.post_unit(
            session,
            &format!(
                "/panel/api/inbounds/{}/delClient/{}",
                session.inbound_id, client.id
            ),
            json!({}),
        )
        .await?;

        Ok(true)
    }

    async fn connection_descriptor(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<String>, PanelError> {
        let (inbound, clients) = self.clients(session).await?;

        Ok(clients
            .iter()
            .find(|client| client.email == alias)
            .and_then(|client| {
                render_descriptor(&inbound, &session.public_host, &client.id, &session.host_name)
            }))
    }

    async fn client_traffic(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<TrafficCounters>, PanelError> {
        let path = format!("/panel/api/inbounds/getClientTraffics/{alias}");
        match self.get::<ClientTraffic>(session, &path).await {
            Ok(traffic) => Ok(Some(TrafficCounters {
                up: traffic.up,
                down: traffic.down,
                total: traffic.total,
            })),
            // The panel answers with a null object for unknown emails
            Err(PanelError::Decode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
