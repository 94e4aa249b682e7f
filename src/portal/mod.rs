use crate::error::{AppError, FetchError};
use crate::models::MeterUsage;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod auth;
pub mod usage;

#[cfg(test)]
pub(crate) mod fake;

pub use auth::{AuthSession, AuthenticatedSession};

pub const CLIENT_ID: &str = "cedfde2d-79a7-44fd-9833-cae769640d3d";
pub const B2C_POLICY: &str = "B2C_1_tw_website_signin";
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Login account identity. Immutable for the lifetime of a client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub account_number: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("account_number", &self.account_number)
            .finish()
    }
}

/// Base URLs of the identity provider and the customer portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub login_base: String,
    pub account_base: String,
    pub redirect_uri: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            login_base: "https://login.thameswater.co.uk/identity.thameswater.co.uk".into(),
            account_base: "https://myaccount.thameswater.co.uk".into(),
            redirect_uri: "https://www.thameswater.co.uk/login".into(),
        }
    }
}

impl PortalEndpoints {
    pub fn authorize_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/authorize",
            self.login_base,
            B2C_POLICY.to_ascii_lowercase()
        )
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base,
            B2C_POLICY.to_ascii_lowercase()
        )
    }

    pub fn self_asserted_url(&self) -> String {
        format!("{}/{}/SelfAsserted", self.login_base, B2C_POLICY)
    }

    pub fn confirmed_url(&self) -> String {
        format!(
            "{}/{}/api/CombinedSigninAndSignup/confirmed",
            self.login_base, B2C_POLICY
        )
    }

    pub fn dashboard_url(&self) -> String {
        format!("{}/mydashboard", self.account_base)
    }

    pub fn meters_usage_url(&self) -> String {
        format!("{}/mydashboard/my-meters-usage", self.account_base)
    }

    pub fn sign_in_url(&self) -> String {
        format!("{}/twservice/Account/SignIn?useremail=", self.account_base)
    }

    pub fn portal_login_url(&self) -> String {
        format!("{}/login", self.account_base)
    }

    pub fn consumption_url(&self) -> String {
        format!(
            "{}/ajax/waterMeter/getSmartWaterMeterConsumptions",
            self.account_base
        )
    }
}

fn client_builder(jar: Arc<Jar>) -> ClientBuilder {
    Client::builder()
        .cookie_provider(jar)
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
}

/// Builds the browser-like client shared by every step of one session.
pub fn build_client(jar: Arc<Jar>) -> Result<Client, AppError> {
    Ok(client_builder(jar).build()?)
}

/// Same session as [`build_client`] but hands 3xx responses back to the
/// caller. Followed redirects lose the URL fragment, which is where the
/// identity provider puts the authorization code.
pub fn build_manual_redirect_client(jar: Arc<Jar>) -> Result<Client, AppError> {
    Ok(client_builder(jar).redirect(Policy::none()).build()?)
}

/// Something that can answer single-day usage queries for a meter.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch_day(&self, meter_id: &str, day: NaiveDate) -> Result<MeterUsage, FetchError>;
}

/// Entry point of an update cycle: logs in and hands back a usage source.
#[async_trait]
pub trait MeterPortal: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn UsageSource>, AppError>;
}

/// The live Thames Water customer portal.
#[derive(Debug, Clone, Default)]
pub struct ThamesWaterPortal {
    endpoints: PortalEndpoints,
}

impl ThamesWaterPortal {
    pub fn new(endpoints: PortalEndpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl MeterPortal for ThamesWaterPortal {
    fn name(&self) -> &'static str {
        "thames-water"
    }

    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn UsageSource>, AppError> {
        let session = AuthSession::new(self.endpoints.clone())?;
        let authenticated = session.authenticate(credentials).await?;
        Ok(Box::new(authenticated))
    }
}
