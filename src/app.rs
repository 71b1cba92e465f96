use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use directories::BaseDirs;
use log::{debug, warn};

use crate::api::models::TokenResponse;
use crate::error::ConfigError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_LANGUAGE: &str = "en";

/// Settings and credentials that survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppState {
    pub api_base_url: String,
    pub language: String,
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            token: None,
            refresh_token: None,
            user_id: None,
            user_email: None,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("realchat.toml"))
    }

    /// Load from the default location. A missing or unreadable file gives
    /// the defaults.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::new();
        };
        match Self::load_from(&path) {
            Ok(state) => state,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::new(),
            Err(e) => {
                warn!("Ignoring config at {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str::<AppState>(&text)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Token and user id, when both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.token.as_deref().filter(|t| !t.is_empty())?;
        let user_id = self.user_id.as_deref().filter(|u| !u.is_empty())?;
        Some((token, user_id))
    }

    pub fn store_tokens(&mut self, tokens: &TokenResponse, email: &str) {
        self.token = Some(tokens.access_token.clone());
        self.refresh_token = tokens.refresh_token.clone();
        self.user_id = Some(tokens.user_id.clone());
        self.user_email = Some(email.to_string());
    }

    pub fn clear_credentials(&mut self) {
        self.token = None;
        self.refresh_token = None;
        self.user_id = None;
        self.user_email = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("realchat.toml");

        let mut state = AppState::new();
        state.store_tokens(
            &TokenResponse {
                access_token: "tok".into(),
                refresh_token: Some("ref".into()),
                user_id: "u1".into(),
            },
            "ann@example.com",
        );
        state.save_to(&path).unwrap();

        let loaded = AppState::load_from(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.credentials(), Some(("tok", "u1")));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("realchat.toml");
        fs::write(&path, "language = \"hi\"\n").unwrap();

        let loaded = AppState::load_from(&path).unwrap();
        assert_eq!(loaded.language, "hi");
        assert_eq!(loaded.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(loaded.credentials(), None);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("realchat.toml");
        fs::write(&path, "token = [").unwrap();
        assert!(matches!(AppState::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn clearing_credentials_keeps_settings() {
        let mut state = AppState {
            api_base_url: "https://chat.example.com".into(),
            token: Some("tok".into()),
            user_id: Some("u1".into()),
            ..AppState::default()
        };
        state.clear_credentials();
        assert_eq!(state.credentials(), None);
        assert_eq!(state.api_base_url, "https://chat.example.com");
    }
}
