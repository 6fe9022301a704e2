use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::session::Session;
use crate::state::SessionState;
use crate::transitions::Transition;

/// Opaque device credentials presented when identifying on the signal channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub device_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub organization_id: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub organization_name: Option<String>,
}

pub trait CredentialsService: Send + Sync {
    fn fetch_credentials(&self) -> BoxFuture<'_, Result<Credentials, SessionError>>;
}

pub trait OrganizationService: Send + Sync {
    fn fetch_organization<'a>(
        &'a self,
        subdomain: &'a str,
    ) -> BoxFuture<'a, Result<Organization, SessionError>>;
}

/// Room URL split into the organization subdomain and the room path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLocation {
    pub subdomain: String,
    pub room_name: String,
}

/// Parse `https://acme.example.com/my-room` into (`acme`, `/my-room`).
///
/// The scheme may be omitted; a trailing slash is ignored.
pub fn parse_room_url(input: &str) -> Result<RoomLocation, SessionError> {
    let input = input.trim().trim_end_matches('/');
    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };
    let url = url::Url::parse(&with_scheme)
        .map_err(|e| SessionError::InvalidUrl(format!("'{input}': {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidUrl(format!("'{input}' has no host")))?;
    let subdomain = host.split('.').next().unwrap_or_default().to_string();
    if subdomain.is_empty() || !host.contains('.') {
        return Err(SessionError::InvalidUrl(format!(
            "expected '<organization>.<domain>/<room>', got '{input}'"
        )));
    }

    let room_name = url.path().trim_end_matches('/').to_string();
    let re = regex::Regex::new(r"^/[A-Za-z0-9][A-Za-z0-9_-]*$")
        .map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    if !re.is_match(&room_name) {
        return Err(SessionError::InvalidUrl(format!(
            "invalid room name '{room_name}'"
        )));
    }

    Ok(RoomLocation {
        subdomain,
        room_name,
    })
}

/// HTTP client for the platform API. Provides both resolvers.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn organization_url(&self, subdomain: &str) -> String {
        format!(
            "{}/organization-subdomains/{}/?fields={}",
            self.base_url,
            urlencoding::encode(subdomain),
            urlencoding::encode("permissions,account")
        )
    }

    async fn post_devices(&self) -> Result<Credentials, SessionError> {
        let url = format!("{}/devices", self.base_url);
        tracing::info!("requesting device credentials from {url}");
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SessionError::Credentials(format!(
                "API returned status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| SessionError::Credentials(format!("invalid API response: {e}")))
    }

    async fn get_organization(&self, subdomain: &str) -> Result<Organization, SessionError> {
        let url = self.organization_url(subdomain);
        tracing::info!("resolving organization from {url}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SessionError::Organization(format!(
                "no organization for subdomain '{subdomain}'"
            )));
        }
        if !resp.status().is_success() {
            return Err(SessionError::Organization(format!(
                "API returned status {}",
                resp.status()
            )));
        }
        let mut organization: Organization = resp
            .json()
            .await
            .map_err(|e| SessionError::Organization(format!("invalid API response: {e}")))?;
        if organization.subdomain.is_empty() {
            organization.subdomain = subdomain.to_string();
        }
        Ok(organization)
    }
}

impl CredentialsService for ApiClient {
    fn fetch_credentials(&self) -> BoxFuture<'_, Result<Credentials, SessionError>> {
        Box::pin(self.post_devices())
    }
}

impl OrganizationService for ApiClient {
    fn fetch_organization<'a>(
        &'a self,
        subdomain: &'a str,
    ) -> BoxFuture<'a, Result<Organization, SessionError>> {
        Box::pin(self.get_organization(subdomain))
    }
}

pub fn should_fetch_credentials(state: &SessionState) -> bool {
    let credentials = &state.device_credentials;
    state.app.wants_to_join && !credentials.is_fetching && credentials.data.is_none()
}

/// Waits for credentials to settle so both requests do not race.
pub fn should_fetch_organization(state: &SessionState) -> bool {
    let organization = &state.organization;
    let credentials = &state.device_credentials;
    state.app.wants_to_join
        && organization.data.is_none()
        && !organization.is_fetching
        && !organization.error
        && !credentials.is_fetching
        && credentials.data.is_some()
}

/// Fetch device credentials once. A failure leaves `is_fetching` set, so
/// nothing retries until the process restarts.
pub(crate) async fn fetch_credentials(session: &Session, service: Arc<dyn CredentialsService>) {
    if !session.dispatch_if(should_fetch_credentials, Transition::DeviceCredentialsRequested) {
        return;
    }
    match service.fetch_credentials().await {
        Ok(credentials) => {
            tracing::info!(device_id = %credentials.device_id, "device credentials fetched");
            session.dispatch(Transition::DeviceCredentialsFulfilled(credentials));
        }
        Err(e) => {
            tracing::error!("device credentials fetch failed: {e}");
            session.dispatch(Transition::DeviceCredentialsRejected(e.to_string()));
        }
    }
}

pub(crate) async fn fetch_organization(
    session: &Session,
    service: Arc<dyn OrganizationService>,
) {
    let room_url = session.snapshot().app.room_url.clone();
    if !session.dispatch_if(should_fetch_organization, Transition::OrganizationRequested) {
        return;
    }
    let result = match parse_room_url(&room_url) {
        Ok(location) => service.fetch_organization(&location.subdomain).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(organization) => {
            tracing::info!(
                organization_id = %organization.organization_id,
                "organization resolved"
            );
            session.dispatch(Transition::OrganizationFulfilled(organization));
        }
        Err(e) => {
            tracing::error!("organization lookup for {room_url} failed: {e}");
            session.dispatch(Transition::OrganizationRejected(e.to_string()));
        }
    }
}
