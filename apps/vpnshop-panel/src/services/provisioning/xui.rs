//! 3x-ui panel adapter.
//!
//! Panel calls share one login session. A caller takes a [`SessionLease`]
//! from the [`SessionPool`]; the lease logs in when the session is missing or
//! older than its TTL, and is given back when it goes out of scope. A 401/403
//! from the panel invalidates the session so the next lease logs in again.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, header::COOKIE};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnshop_db::models::order::ServiceOrder;

use super::{ProviderRef, ProvisioningAdapter, ProvisioningError};

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

#[derive(Debug)]
struct PanelSession {
    cookie: String,
    established: Instant,
}

pub struct SessionPool {
    slot: Arc<Mutex<Option<PanelSession>>>,
    ttl: Duration,
}

pub struct SessionLease {
    guard: OwnedMutexGuard<Option<PanelSession>>,
}

impl SessionLease {
    pub fn cookie(&self) -> &str {
        self.guard.as_ref().map(|s| s.cookie.as_str()).unwrap_or_default()
    }

    /// Drops the session; the next lease logs in again.
    pub fn invalidate(&mut self) {
        *self.guard = None;
    }
}

impl SessionPool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    pub async fn lease<F, Fut>(&self, login: F) -> Result<SessionLease, ProvisioningError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ProvisioningError>>,
    {
        let mut guard = self.slot.clone().lock_owned().await;
        let fresh = guard
            .as_ref()
            .is_some_and(|session| session.established.elapsed() < self.ttl);
        if !fresh {
            *guard = None;
            let cookie = login().await?;
            *guard = Some(PanelSession {
                cookie,
                established: Instant::now(),
            });
        }
        Ok(SessionLease { guard })
    }
}

/// `inbound:client-uuid:email`, everything needed to address a 3x-ui client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XuiClientRef {
    pub inbound_id: i64,
    pub client_id: Uuid,
    pub email: String,
}

impl fmt::Display for XuiClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inbound_id, self.client_id, self.email)
    }
}

impl FromStr for XuiClientRef {
    type Err = ProvisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProvisioningError::Permanent(format!("unrecognised provider ref {s:?}"));
        let mut parts = s.splitn(3, ':');
        let inbound_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let client_id = parts.next().and_then(|p| Uuid::parse_str(p).ok()).ok_or_else(bad)?;
        let email = parts.next().filter(|e| !e.is_empty()).ok_or_else(bad)?;
        Ok(Self {
            inbound_id,
            client_id,
            email: email.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Value,
}

pub struct XuiPanel {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    sessions: SessionPool,
}

fn transport(e: reqwest::Error) -> ProvisioningError {
    ProvisioningError::Transient(format!("panel unreachable: {e}"))
}

fn classify_status(status: StatusCode) -> Option<ProvisioningError> {
    if status.is_success() {
        None
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(ProvisioningError::Transient(format!("panel returned {status}")))
    } else {
        Some(ProvisioningError::Permanent(format!("panel returned {status}")))
    }
}

fn client_email(order: &ServiceOrder) -> String {
    let credential = order.credential_id.simple().to_string();
    format!("u{}-{}", order.user_id, &credential[..8])
}

/// Client entry with absolute limits; the same order always yields the same body.
fn client_settings(order: &ServiceOrder, client_id: Uuid, email: &str) -> String {
    let client = json!({
        "id": client_id.to_string(),
        "email": email,
        "enable": true,
        "flow": "",
        "limitIp": order.spec.ip_limit,
        "totalGB": order.spec.traffic_gb.saturating_mul(BYTES_PER_GB),
        "expiryTime": order.expires_at().timestamp_millis(),
        "tgId": "",
        "subId": order.credential_id.simple().to_string(),
        "reset": 0,
    });
    json!({ "clients": [client] }).to_string()
}

impl XuiPanel {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        username: String,
        password: String,
        session_ttl: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            sessions: SessionPool::new(session_ttl),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String, ProvisioningError> {
        debug!("logging in to 3x-ui panel");
        let resp = self
            .client
            .post(self.url("/login"))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(transport)?;

        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }

        let cookie = resp
            .cookies()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; ");
        let body: ApiResponse = resp.json().await.map_err(transport)?;
        if !body.success || cookie.is_empty() {
            return Err(ProvisioningError::Permanent(format!("panel login rejected: {}", body.msg)));
        }

        info!("3x-ui session established");
        Ok(cookie)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<ApiResponse, ProvisioningError> {
        let mut lease = self.sessions.lease(|| self.login()).await?;

        let mut request = self
            .client
            .request(method, self.url(path))
            .header(COOKIE, lease.cookie());
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await.map_err(transport)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            lease.invalidate();
            return Err(ProvisioningError::Transient("panel session rejected".into()));
        }
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        match resp.json::<ApiResponse>().await {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                // An expired session is answered with the login page instead of JSON.
                lease.invalidate();
                Err(ProvisioningError::Transient(format!("unexpected panel response: {e}")))
            }
        }
    }

    fn rejected(op: &str, resp: &ApiResponse) -> ProvisioningError {
        warn!(op, msg = %resp.msg, "panel rejected request");
        ProvisioningError::Permanent(format!("{op} rejected: {}", resp.msg))
    }
}

#[async_trait]
impl ProvisioningAdapter for XuiPanel {
    async fn find(&self, order: &ServiceOrder) -> Result<Option<ProviderRef>, ProvisioningError> {
        let email = client_email(order);
        let resp = self
            .call(
                Method::GET,
                &format!("/panel/api/inbounds/getClientTraffics/{email}"),
                None,
            )
            .await?;

        if !resp.success || resp.obj.is_null() {
            return Ok(None);
        }
        let inbound_id = resp
            .obj
            .get("inboundId")
            .and_then(Value::as_i64)
            .unwrap_or(order.spec.inbound_id);
        Ok(Some(
            XuiClientRef {
                inbound_id,
                client_id: order.credential_id,
                email,
            }
            .to_string(),
        ))
    }

    async fn provision(&self, order: &ServiceOrder) -> Result<ProviderRef, ProvisioningError> {
        let email = client_email(order);
        let body = json!({
            "id": order.spec.inbound_id,
            "settings": client_settings(order, order.credential_id, &email),
        });
        let resp = self
            .call(Method::POST, "/panel/api/inbounds/addClient", Some(body))
            .await?;
        if !resp.success {
            return Err(Self::rejected("addClient", &resp));
        }

        Ok(XuiClientRef {
            inbound_id: order.spec.inbound_id,
            client_id: order.credential_id,
            email,
        }
        .to_string())
    }

    async fn renew(&self, provider_ref: &str, order: &ServiceOrder) -> Result<(), ProvisioningError> {
        let target: XuiClientRef = provider_ref.parse()?;
        let body = json!({
            "id": target.inbound_id,
            "settings": client_settings(order, target.client_id, &target.email),
        });
        let resp = self
            .call(
                Method::POST,
                &format!("/panel/api/inbounds/updateClient/{}", target.client_id),
                Some(body),
            )
            .await?;
        if !resp.success {
            return Err(Self::rejected("updateClient", &resp));
        }
        Ok(())
    }

    async fn deactivate(&self, provider_ref: &str) -> Result<(), ProvisioningError> {
        let target: XuiClientRef = provider_ref.parse()?;
        let resp = self
            .call(
                Method::POST,
                &format!("/panel/api/inbounds/{}/delClient/{}", target.inbound_id, target.client_id),
                None,
            )
            .await?;
        if !resp.success {
            return Err(Self::rejected("delClient", &resp));
        }
        Ok(())
    }
}
