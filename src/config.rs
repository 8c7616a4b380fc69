use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceKeys {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub service: String,
    pub username: String,
    pub password_md5: String,
    /// Browser cookie for music.youtube.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// Cached mobile session; cleared when the service rejects it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: HashMap<String, ServiceKeys>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/ytm-scrobbler/config.json");
    dirs::home_dir().map_or(fallback, |home| {
        home.join(".config/ytm-scrobbler/config.json")
    })
}

pub fn default_db_path(service: &str, username: &str) -> PathBuf {
    let file_name = format!("{service}-{username}.db");
    let fallback = PathBuf::from(".local/share/ytm-scrobbler").join(&file_name);
    dirs::data_dir().map_or(fallback, |data| data.join("ytm-scrobbler").join(file_name))
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}

pub fn set_service_keys(config: &mut Config, service: &str, api_key: &str, api_secret: &str) {
    config.services.insert(
        service.to_string(),
        ServiceKeys {
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        },
    );
}

/// Adds an account or replaces its password. A changed password
/// invalidates the cached session.
pub fn add_account(config: &mut Config, service: &str, username: &str, password: &str) {
    let password_md5 = format!("{:x}", md5::compute(password));
    if let Some(account) = find_account_mut(config, service, username) {
        if account.password_md5 != password_md5 {
            account.session_key = None;
        }
        account.password_md5 = password_md5;
        return;
    }
    config.accounts.push(Account {
        service: service.to_string(),
        username: username.to_string(),
        password_md5,
        cookie: None,
        session_key: None,
        db_path: None,
    });
}

pub fn remove_account(config: &mut Config, service: &str, username: &str) -> bool {
    let original_len = config.accounts.len();
    config
        .accounts
        .retain(|account| !(account.service == service && account.username == username));
    config.accounts.len() != original_len
}

pub fn find_account_mut<'a>(
    config: &'a mut Config,
    service: &str,
    username: &str,
) -> Option<&'a mut Account> {
    config
        .accounts
        .iter_mut()
        .find(|account| account.service == service && account.username == username)
}

pub fn iter_accounts<'a>(
    config: &'a Config,
    service: Option<&str>,
) -> impl Iterator<Item = &'a Account> {
    config
        .accounts
        .iter()
        .filter(move |account| service.is_none_or(|svc| svc == account.service))
}

pub fn get_service_keys<'a>(config: &'a Config, service: &str) -> Option<&'a ServiceKeys> {
    config.services.get(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert!(config.accounts.is_empty());
        assert!(config.services.is_empty());
    }

    #[test]
    fn accounts_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = Config::default();
        set_service_keys(&mut config, "lastfm", "key", "secret");
        add_account(&mut config, "lastfm", "alice", "hunter2");
        find_account_mut(&mut config, "lastfm", "alice").unwrap().cookie =
            Some("SAPISID=a; __Secure-3PAPISID=b".to_string());
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        let account = iter_accounts(&loaded, Some("lastfm")).next().unwrap();
        assert_eq!(account.password_md5, format!("{:x}", md5::compute("hunter2")));
        assert_eq!(account.cookie.as_deref(), Some("SAPISID=a; __Secure-3PAPISID=b"));
        assert!(account.session_key.is_none());
        assert_eq!(get_service_keys(&loaded, "lastfm").unwrap().api_secret, "secret");
    }

    #[test]
    fn legacy_accounts_without_cookie_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"accounts": [{"service": "librefm", "username": "bob", "password_md5": "x"}]}"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.accounts[0].username, "bob");
        assert!(config.accounts[0].cookie.is_none());
    }

    #[test]
    fn password_change_drops_cached_session() {
        let mut config = Config::default();
        add_account(&mut config, "lastfm", "alice", "old");
        find_account_mut(&mut config, "lastfm", "alice").unwrap().session_key = Some("sk".to_string());
        add_account(&mut config, "lastfm", "alice", "old");
        assert!(config.accounts[0].session_key.is_some());
        add_account(&mut config, "lastfm", "alice", "new");
        assert!(config.accounts[0].session_key.is_none());
        assert_eq!(config.accounts.len(), 1);
    }

    #[test]
    fn removes_only_the_named_account() {
        let mut config = Config::default();
        add_account(&mut config, "lastfm", "alice", "pw");
        add_account(&mut config, "librefm", "alice", "pw");
        assert!(remove_account(&mut config, "lastfm", "alice"));
        assert!(!remove_account(&mut config, "lastfm", "alice"));
        assert_eq!(iter_accounts(&config, None).count(), 1);
    }

    #[test]
    fn database_path_is_per_account() {
        let path = default_db_path("lastfm", "alice");
        assert!(path.ends_with("ytm-scrobbler/lastfm-alice.db"));
    }
}
