use crate::error::ConfigError;
use std::path::PathBuf;

pub const COOKIE_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub bind_address: String,
    /// Glob handed to tera.
    pub templates: String,
    pub cookie_key: Vec<u8>,
    pub bcrypt_cost: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("kinoflix.db"),
            bind_address: "127.0.0.1:8080".to_owned(),
            templates: concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*").to_owned(),
            cookie_key: vec![0u8; COOKIE_KEY_LEN],
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        if let Some(path) = lookup("KINOFLIX_DB_PATH") {
            settings.database_path = PathBuf::from(path);
        }
        if let Some(address) = lookup("KINOFLIX_BIND") {
            settings.bind_address = address;
        }
        if let Some(templates) = lookup("KINOFLIX_TEMPLATES") {
            settings.templates = templates;
        }
        match lookup("KINOFLIX_COOKIE_KEY") {
            Some(key) if key.len() < COOKIE_KEY_LEN => {
                return Err(ConfigError::TooShort {
                    var: "KINOFLIX_COOKIE_KEY",
                    min: COOKIE_KEY_LEN,
                })
            }
            Some(key) => settings.cookie_key = key.into_bytes(),
            None => log::warn!("KINOFLIX_COOKIE_KEY is not set, sessions use an all-zero key"),
        }
        if let Some(cost) = lookup("KINOFLIX_BCRYPT_COST") {
            settings.bcrypt_cost = cost
                .trim()
                .parse()
                .ok()
                .filter(|cost| (4..=31).contains(cost))
                .ok_or(ConfigError::Invalid {
                    var: "KINOFLIX_BCRYPT_COST",
                    value: cost,
                })?;
        }
        Ok(settings)
    }
}
