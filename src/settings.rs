use crate::error::AppError;
use crate::portal::Credentials;
use ::config::{Config, Environment, File, FileFormat};
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "water-meter";
pub const ENV_PREFIX: &str = "WATER_METER";
pub const PASSWORD_ENV: &str = "WATER_METER_PASSWORD";

pub const DEFAULT_LITER_COST: f64 = 0.002;
pub const DEFAULT_TIMEZONE: &str = "Europe/London";
pub const DEFAULT_CURRENCY: &str = "GBP";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("WATER_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("uk", "thameswater", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".water-meter"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub email: Option<String>,
    pub account_number: Option<String>,
    pub meter_id: Option<String>,
    pub liter_cost: f64,
    pub fetch_hours: Option<String>,
    pub timezone: String,
    pub currency: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            email: None,
            account_number: None,
            meter_id: None,
            liter_cost: DEFAULT_LITER_COST,
            fetch_hours: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

/// Validated settings an update cycle runs with.
#[derive(Debug, Clone)]
pub struct MeterSettings {
    pub credentials: Credentials,
    pub meter_id: String,
    pub liter_cost: f64,
    pub timezone: Tz,
    pub currency: String,
}

fn required(value: Option<&str>, field: &str) -> Result<String, AppError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::Config(format!(
            "{field} is not configured. Run `water-meter configure`."
        ))),
    }
}

impl MeterSettings {
    pub fn from_config(cfg: &AppConfig, password: Option<String>) -> Result<Self, AppError> {
        let email = required(cfg.email.as_deref(), "email")?;
        let password = match password {
            Some(p) if !p.is_empty() => p,
            _ => {
                return Err(AppError::Config(format!(
                    "password is not configured. Run `water-meter configure --password` or set {PASSWORD_ENV}."
                )))
            }
        };
        let account_number = required(cfg.account_number.as_deref(), "account_number")?;
        let meter_id = required(cfg.meter_id.as_deref(), "meter_id")?;

        if !cfg.liter_cost.is_finite() || cfg.liter_cost < 0.0 {
            return Err(AppError::Config(format!(
                "liter_cost must be a non-negative number, got {}",
                cfg.liter_cost
            )));
        }
        let timezone: Tz = cfg
            .timezone
            .parse()
            .map_err(|_| AppError::Config(format!("unknown timezone '{}'", cfg.timezone)))?;

        Ok(Self {
            credentials: Credentials {
                email,
                password,
                account_number,
            },
            meter_id,
            liter_cost: cfg.liter_cost,
            timezone,
            currency: cfg.currency.clone(),
        })
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("statistics.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

/// Values stay strings; numeric-looking ids such as `0123456` must keep
/// their leading zeros.
fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
}

fn layered_config(path: &Path, env: Environment) -> Result<AppConfig, AppError> {
    let path_str = path.to_string_lossy();
    let cfg = Config::builder()
        .add_source(File::new(&path_str, FileFormat::Toml).required(false))
        .add_source(env)
        .build()?;
    Ok(cfg.try_deserialize()?)
}

/// Loads `config.toml` with `WATER_METER_*` environment overrides applied.
pub fn load_config() -> Result<AppConfig, AppError> {
    layered_config(&config_path()?, env_overrides())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn keyring_entry(email: &str) -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("portal:{}", email.trim().to_ascii_lowercase()),
    )?)
}

pub fn set_password(email: &str, password: &str) -> Result<(), AppError> {
    keyring_entry(email)?.set_password(password)?;
    Ok(())
}

/// Password from the OS keyring, falling back to `WATER_METER_PASSWORD`.
pub fn get_password(email: Option<&str>) -> Option<String> {
    if let Some(email) = email.filter(|e| !e.trim().is_empty()) {
        if let Ok(value) = keyring_entry(email).and_then(|e| Ok(e.get_password()?)) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    std::env::var(PASSWORD_ENV).ok().filter(|v| !v.is_empty())
}

/// Parses the `fetch_hours` override (`"6, 18"`).
pub fn parse_fetch_hours(raw: &str) -> Option<Vec<u32>> {
    let hours = raw
        .split(',')
        .map(|h| h.trim().parse::<u32>().ok().filter(|h| *h < 24))
        .collect::<Option<Vec<_>>>()?;
    (!hours.is_empty()).then_some(hours)
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}
