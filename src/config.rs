use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_GEOCODER_API_URL: &str = "https://api.visicom.ua/data-api/5.0/uk/geocode.json";
const DEFAULT_REQUEST_DELAY_MS: u64 = 800;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LARGE_SETTLEMENTS: &[&str] = &[
    "Київ",
    "Харків",
    "Одеса",
    "Дніпро",
    "Львів",
    "Запоріжжя",
    "Кривий Ріг",
    "Миколаїв",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_api_url: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_request_delay_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub geocoder_region: Option<String>,
    pub geocoder_intersect: Option<String>,
    pub large_settlements: Vec<String>,
    pub database_file_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_api_url: String,
    pub geocoder_request_delay_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub geocoder_region: Option<String>,
    pub has_geocoder_intersect: bool,
    pub large_settlements: Vec<String>,
    pub database_file_name: String,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_api_url: env::var("GEOCODER_API_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_API_URL.to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_request_delay_ms: parse_u64(
                "GEOCODER_REQUEST_DELAY_MS",
                DEFAULT_REQUEST_DELAY_MS,
            ),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)
                .max(1),
            geocoder_region: parse_optional("GEOCODER_REGION"),
            geocoder_intersect: parse_optional("GEOCODER_INTERSECT"),
            large_settlements: parse_list("GEOCODER_LARGE_SETTLEMENTS")
                .unwrap_or_else(default_large_settlements),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "geomap.db".to_string()),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_api_url: self.geocoder_api_url.clone(),
            geocoder_request_delay_ms: self.geocoder_request_delay_ms,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_region: self.geocoder_region.clone(),
            has_geocoder_intersect: self.geocoder_intersect.is_some(),
            large_settlements: self.large_settlements.clone(),
            database_file_name: self.database_file_name.clone(),
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

pub fn default_large_settlements() -> Vec<String> {
    DEFAULT_LARGE_SETTLEMENTS
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    Some(items)
}
