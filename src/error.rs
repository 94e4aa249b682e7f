use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

/// The seven ordered exchanges of the portal login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    Authorize,
    SelfAsserted,
    Confirmed,
    TokenExchange,
    TokenRefresh,
    DashboardWarmup,
    PortalLogin,
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthStep::Authorize => "authorize",
            AuthStep::SelfAsserted => "self-asserted",
            AuthStep::Confirmed => "confirmed",
            AuthStep::TokenExchange => "token exchange",
            AuthStep::TokenRefresh => "token refresh",
            AuthStep::DashboardWarmup => "dashboard warm-up",
            AuthStep::PortalLogin => "portal login",
        };
        f.write_str(label)
    }
}

/// Terminal failure of a login attempt. Any session state built before the
/// failing step is discarded together with the error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed at {step}: {source}")]
    Transport {
        step: AuthStep,
        #[source]
        source: reqwest::Error,
    },

    #[error("authentication failed at {step}: {detail}")]
    Protocol { step: AuthStep, detail: String },
}

impl AuthError {
    pub fn transport(step: AuthStep) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| AuthError::Transport { step, source }
    }

    pub fn protocol(step: AuthStep, detail: impl Into<String>) -> Self {
        AuthError::Protocol {
            step,
            detail: detail.into(),
        }
    }

    pub fn step(&self) -> AuthStep {
        match self {
            AuthError::Transport { step, .. } | AuthError::Protocol { step, .. } => *step,
        }
    }

    /// The identity provider rejected the submitted email/password.
    pub fn is_invalid_credentials(&self) -> bool {
        match self {
            AuthError::Transport {
                step: AuthStep::SelfAsserted,
                source,
            } => source.status().is_some(),
            AuthError::Protocol { step, .. } => *step == AuthStep::SelfAsserted,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("usage request for meter {meter} on {day} failed: {source}")]
    Transport {
        meter: String,
        day: NaiveDate,
        #[source]
        source: reqwest::Error,
    },

    #[error("usage response for meter {meter} on {day} is malformed: {source}")]
    Decode {
        meter: String,
        day: NaiveDate,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error("corrupt statistics row for {series}: {detail}")]
    Corrupt { series: String, detail: String },

    #[error("statistics store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time label {label:?}")]
pub struct LabelParseError {
    pub label: String,
}
