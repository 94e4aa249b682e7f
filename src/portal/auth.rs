use crate::error::{AppError, AuthError, AuthStep};
use crate::pkce::PkceMaterial;
use crate::portal::{
    build_client, build_manual_redirect_client, Credentials, PortalEndpoints, B2C_POLICY,
    CLIENT_ID,
};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::LOCATION;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

const TRANS_COOKIE: &str = "x-ms-cpim-trans";
const CSRF_COOKIE: &str = "x-ms-cpim-csrf";
const AUTHENTICATED_COOKIE: &str = "b2cAuthenticated=true; Path=/";
const MAX_CONFIRM_REDIRECTS: usize = 10;

const MSAL_SKU: &str = "msal.js.browser";
const MSAL_VERSION: &str = "3.1.0";
const MSAL_CAPABILITY: &str = "retry-after, h429";
const MSAL_LAST_TELEMETRY: &str = "5|0|||0,0";

/// Transaction handles issued by the authorize step.
#[derive(Clone)]
struct B2cTransaction {
    trans: String,
    csrf: String,
}

impl B2cTransaction {
    fn state_properties(&self) -> String {
        format!("StateProperties={}", self.trans)
    }
}

/// OAuth token set returned by the token endpoint.
#[derive(Clone, Deserialize)]
pub struct TokenSet {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |present: bool| if present { "<redacted>" } else { "<none>" };
        f.debug_struct("TokenSet")
            .field("refresh_token", &redacted(!self.refresh_token.is_empty()))
            .field("access_token", &redacted(self.access_token.is_some()))
            .field("id_token", &redacted(self.id_token.is_some()))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Values the portal sign-in page hands over to the final login POST.
struct PortalHandoff {
    state: String,
    id_token: String,
}

/// A login in progress. Consumed by [`AuthSession::authenticate`].
///
/// Each step consumes the output of the previous one; the first failure
/// ends the attempt and the partially built session is dropped with it.
pub struct AuthSession {
    client: Client,
    manual_redirects: Client,
    jar: Arc<Jar>,
    endpoints: PortalEndpoints,
}

/// A session that completed every login step and may call the usage API.
pub struct AuthenticatedSession {
    pub(crate) client: Client,
    pub(crate) endpoints: PortalEndpoints,
    pub(crate) account_number: String,
    pub(crate) tokens: TokenSet,
}

impl fmt::Debug for AuthenticatedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedSession")
            .field("account_number", &self.account_number)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

async fn send(step: AuthStep, request: RequestBuilder) -> Result<Response, AuthError> {
    request
        .send()
        .await
        .map_err(AuthError::transport(step))?
        .error_for_status()
        .map_err(AuthError::transport(step))
}

/// Absolute target of a 3xx response, `None` for any other status.
fn redirect_target(step: AuthStep, response: &Response) -> Result<Option<Url>, AuthError> {
    if !response.status().is_redirection() {
        return Ok(None);
    }
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AuthError::protocol(step, "redirect without a location"))?;
    response
        .url()
        .join(location)
        .map(Some)
        .map_err(|e| AuthError::protocol(step, format!("invalid redirect location: {e}")))
}

fn parse_url(step: AuthStep, raw: &str) -> Result<Url, AuthError> {
    Url::parse(raw).map_err(|e| AuthError::protocol(step, format!("invalid url {raw}: {e}")))
}

/// Looks up a cookie in a `Cookie` header value (`a=1; b=2`).
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Extracts the authorization code from the confirmed redirect's fragment.
pub fn code_from_fragment(url: &Url) -> Result<String, String> {
    let fragment = url
        .fragment()
        .ok_or_else(|| "redirect url has no fragment".to_string())?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
        .ok_or_else(|| "redirect fragment carries no code".to_string())
}

/// `state` query parameter of the sign-in redirect, percent-decoded.
pub fn state_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .filter(|state| !state.is_empty())
}

/// `id_token` embedded as a hidden input in the sign-in page.
pub fn id_token_from_html(html: &str) -> Option<String> {
    let re = Regex::new(r#"id=['"]id_token['"]\s+value=['"]([^'"]*)['"]"#).ok()?;
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|token| !token.is_empty())
}

/// B2C answers a rejected sign-in with HTTP 200 and `{"status":"400",...}`.
fn self_asserted_rejection(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Status {
        status: Option<String>,
        message: Option<String>,
    }
    let parsed: Status = serde_json::from_str(body).ok()?;
    match parsed.status.as_deref() {
        Some("200") | None => None,
        Some(code) => Some(format!(
            "sign-in rejected ({code}): {}",
            parsed.message.unwrap_or_default()
        )),
    }
}

impl AuthSession {
    pub fn new(endpoints: PortalEndpoints) -> Result<Self, AppError> {
        let jar = Arc::new(Jar::default());
        let client = build_client(jar.clone())?;
        let manual_redirects = build_manual_redirect_client(jar.clone())?;
        Ok(Self {
            client,
            manual_redirects,
            jar,
            endpoints,
        })
    }

    /// Runs the full login sequence.
    #[instrument(skip_all, fields(account = %credentials.account_number))]
    pub async fn authenticate(
        self,
        credentials: &Credentials,
    ) -> Result<AuthenticatedSession, AuthError> {
        info!("starting portal authentication");
        let pkce = PkceMaterial::generate();

        let result = self.run_steps(credentials, &pkce).await;
        match result {
            Ok(tokens) => {
                info!("portal authentication succeeded");
                Ok(AuthenticatedSession {
                    client: self.client,
                    endpoints: self.endpoints,
                    account_number: credentials.account_number.clone(),
                    tokens,
                })
            }
            Err(e) => {
                warn!(
                    step = %e.step(),
                    invalid_credentials = e.is_invalid_credentials(),
                    error = %e,
                    "portal authentication failed"
                );
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        credentials: &Credentials,
        pkce: &PkceMaterial,
    ) -> Result<TokenSet, AuthError> {
        let transaction = self.authorize(pkce).await?;
        self.self_asserted(credentials, &transaction).await?;
        let code = self.confirmed(&transaction).await?;
        let initial = self.exchange_code(&code, pkce).await?;
        let tokens = self.refresh_tokens(&initial).await?;
        let handoff = self.dashboard_warmup(&credentials.account_number).await?;
        self.portal_login(&handoff).await?;
        Ok(tokens)
    }

    async fn authorize(&self, pkce: &PkceMaterial) -> Result<B2cTransaction, AuthError> {
        let step = AuthStep::Authorize;
        let url = self.endpoints.authorize_url();
        let nonce = uuid::Uuid::new_v4().to_string();
        let state = uuid::Uuid::new_v4().to_string();

        let request = self.client.get(&url).query(&[
            ("client_id", CLIENT_ID),
            ("scope", "openid profile offline_access"),
            ("response_type", "code"),
            ("redirect_uri", self.endpoints.redirect_uri.as_str()),
            ("response_mode", "fragment"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("nonce", nonce.as_str()),
            ("state", state.as_str()),
        ]);
        send(step, request).await?;

        let cookies = self
            .jar
            .cookies(&parse_url(step, &url)?)
            .and_then(|value| value.to_str().ok().map(ToString::to_string))
            .unwrap_or_default();
        let trans = cookie_value(&cookies, TRANS_COOKIE)
            .ok_or_else(|| AuthError::protocol(step, format!("missing {TRANS_COOKIE} cookie")))?;
        let csrf = cookie_value(&cookies, CSRF_COOKIE)
            .ok_or_else(|| AuthError::protocol(step, format!("missing {CSRF_COOKIE} cookie")))?;

        debug!("authorize issued transaction cookies");
        Ok(B2cTransaction { trans, csrf })
    }

    async fn self_asserted(
        &self,
        credentials: &Credentials,
        transaction: &B2cTransaction,
    ) -> Result<(), AuthError> {
        let step = AuthStep::SelfAsserted;
        let state_properties = transaction.state_properties();

        let request = self
            .client
            .post(self.endpoints.self_asserted_url())
            .query(&[("tx", state_properties.as_str()), ("p", B2C_POLICY)])
            .header("x-csrf-token", &transaction.csrf)
            .form(&[
                ("request_type", "RESPONSE"),
                ("email", credentials.email.as_str()),
                ("password", credentials.password.as_str()),
                ("JavaScriptDisabled", "false"),
            ]);
        let body = send(step, request)
            .await?
            .text()
            .await
            .map_err(AuthError::transport(step))?;

        if let Some(detail) = self_asserted_rejection(&body) {
            return Err(AuthError::protocol(step, detail));
        }
        debug!("credentials accepted");
        Ok(())
    }

    /// Redirects are followed by hand until one carries a fragment; the
    /// redirect URI itself is never requested.
    async fn confirmed(&self, transaction: &B2cTransaction) -> Result<String, AuthError> {
        let step = AuthStep::Confirmed;
        let state_properties = transaction.state_properties();

        let request = self
            .manual_redirects
            .get(self.endpoints.confirmed_url())
            .query(&[
                ("rememberMe", "false"),
                ("tx", state_properties.as_str()),
                ("csrf_token", transaction.csrf.as_str()),
                ("p", B2C_POLICY),
            ]);
        let mut response = send(step, request).await?;
        let mut hops = 0;
        let landing = loop {
            match redirect_target(step, &response)? {
                Some(next) if next.fragment().is_some() => break next,
                Some(next) if hops < MAX_CONFIRM_REDIRECTS => {
                    hops += 1;
                    response = send(step, self.manual_redirects.get(next)).await?;
                }
                Some(_) => return Err(AuthError::protocol(step, "too many redirects")),
                None => break response.url().clone(),
            }
        };

        let code = code_from_fragment(&landing).map_err(|detail| {
            warn!(url = %landing.path(), "confirmed redirect lacks an authorization code");
            AuthError::protocol(step, detail)
        })?;
        debug!(hops, "authorization code received");
        Ok(code)
    }

    async fn exchange_code(&self, code: &str, pkce: &PkceMaterial) -> Result<TokenSet, AuthError> {
        let step = AuthStep::TokenExchange;
        let request = self.client.post(self.endpoints.token_url()).form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", self.endpoints.redirect_uri.as_str()),
            ("scope", "openid offline_access profile"),
            ("grant_type", "authorization_code"),
            ("client_info", "1"),
            ("x-client-SKU", MSAL_SKU),
            ("x-client-VER", MSAL_VERSION),
            ("x-ms-lib-capability", MSAL_CAPABILITY),
            ("x-client-current-telemetry", "5|865,0,,,|,"),
            ("x-client-last-telemetry", MSAL_LAST_TELEMETRY),
            ("code_verifier", pkce.verifier.as_str()),
            ("code", code),
        ]);
        self.read_tokens(step, request).await
    }

    /// The provider expects an explicit refresh right after the code exchange.
    /// It is sent as a GET with a form body, as the web client does.
    async fn refresh_tokens(&self, tokens: &TokenSet) -> Result<TokenSet, AuthError> {
        let step = AuthStep::TokenRefresh;
        let request = self.client.get(self.endpoints.token_url()).form(&[
            ("client_id", CLIENT_ID),
            ("scope", "openid profile offline_access"),
            ("grant_type", "refresh_token"),
            ("client_info", "1"),
            ("x-client-SKU", MSAL_SKU),
            ("x-client-VER", MSAL_VERSION),
            ("x-ms-lib-capability", MSAL_CAPABILITY),
            ("x-client-current-telemetry", "5|61,0,,,|@azure/msal-react,2.0.3"),
            ("x-client-last-telemetry", MSAL_LAST_TELEMETRY),
            ("refresh_token", tokens.refresh_token.as_str()),
        ]);
        self.read_tokens(step, request).await
    }

    async fn read_tokens(
        &self,
        step: AuthStep,
        request: RequestBuilder,
    ) -> Result<TokenSet, AuthError> {
        let body = send(step, request)
            .await?
            .text()
            .await
            .map_err(AuthError::transport(step))?;
        let tokens: TokenSet = serde_json::from_str(&body)
            .map_err(|e| AuthError::protocol(step, format!("malformed token response: {e}")))?;
        debug!(step = %step, "token set received");
        Ok(tokens)
    }

    async fn dashboard_warmup(&self, account_number: &str) -> Result<PortalHandoff, AuthError> {
        let step = AuthStep::DashboardWarmup;
        let referer = self.endpoints.sign_in_url();

        send(
            step,
            self.client
                .get(self.endpoints.dashboard_url())
                .header("Referer", &referer),
        )
        .await?;
        send(
            step,
            self.client
                .get(self.endpoints.meters_usage_url())
                .query(&[("contractAccountNumber", account_number)])
                .header("Referer", &referer),
        )
        .await?;

        let response = send(
            step,
            self.client
                .get(self.endpoints.sign_in_url())
                .header("Referer", &referer),
        )
        .await?;
        let landing = response.url().clone();
        let html = response.text().await.map_err(AuthError::transport(step))?;

        let state = state_from_url(&landing)
            .ok_or_else(|| AuthError::protocol(step, "sign-in redirect carries no state"))?;
        let id_token = id_token_from_html(&html)
            .ok_or_else(|| AuthError::protocol(step, "sign-in page carries no id_token"))?;

        send(step, self.client.get(landing)).await?;
        debug!("portal sign-in handoff captured");
        Ok(PortalHandoff { state, id_token })
    }

    async fn portal_login(&self, handoff: &PortalHandoff) -> Result<(), AuthError> {
        let step = AuthStep::PortalLogin;
        let request = self.client.post(self.endpoints.portal_login_url()).form(&[
            ("state", handoff.state.as_str()),
            ("id_token", handoff.id_token.as_str()),
        ]);
        send(step, request).await?;

        // The portal front-end sets this marker client-side; the usage API
        // rejects sessions without it.
        let account = parse_url(step, &self.endpoints.account_base)?;
        self.jar.add_cookie_str(AUTHENTICATED_COOKIE, &account);
        Ok(())
    }
}
