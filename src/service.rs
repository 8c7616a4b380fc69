use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{Account, ServiceKeys};
use crate::scrobble::{FailureKind, ScrobbleSink, ScrobbleTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    LastFm,
    LibreFm,
}

impl Service {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "lastfm" => Ok(Service::LastFm),
            "librefm" => Ok(Service::LibreFm),
            _ => bail!("Unsupported service: {value}"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Service::LastFm => "lastfm",
            Service::LibreFm => "librefm",
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Service::LastFm => "https://ws.audioscrobbler.com/2.0/",
            Service::LibreFm => "https://libre.fm/2.0/",
        }
    }

    /// Libre.fm accepts any key pair, so no registration is needed there.
    pub fn builtin_keys(self) -> Option<ServiceKeys> {
        match self {
            Service::LastFm => None,
            Service::LibreFm => Some(ServiceKeys {
                api_key: "ytm-scrobbler".to_string(),
                api_secret: "ytm-scrobbler".to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },
    #[error("Scrobble rejected (code {code}): {message}")]
    Rejected { code: String, message: String },
}

impl ApiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            // Authentication failed, invalid session, suspended key, invalid key.
            ApiError::Api {
                code: 4 | 9 | 10 | 14 | 15 | 26,
                ..
            } => FailureKind::Auth,
            // Service offline, temporary error, rate limit.
            ApiError::Api {
                code: 11 | 16 | 29, ..
            } => FailureKind::Temporary,
            ApiError::Api { .. } | ApiError::Rejected { .. } => FailureKind::Service,
        }
    }
}

/// Credentials for signed write calls, established once per account.
#[derive(Debug, Clone)]
pub struct Session {
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

impl Session {
    pub fn establish(service: Service, keys: &ServiceKeys, account: &Account) -> Result<Self> {
        let http = http_client()?;
        let session_key =
            fetch_mobile_session(&http, service, &keys.api_key, &keys.api_secret, account)?;
        Ok(Self {
            api_key: keys.api_key.clone(),
            api_secret: keys.api_secret.clone(),
            session_key,
        })
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed building HTTP client")
}

pub struct ScrobbleClient {
    service: Service,
    session: Session,
    http: Client,
    debug_response: bool,
}

impl ScrobbleClient {
    pub fn new(service: Service, session: Session, debug_response: bool) -> Result<Self> {
        Ok(Self {
            service,
            session,
            http: http_client()?,
            debug_response,
        })
    }

    fn scrobble_track(&self, track: &ScrobbleTrack) -> Result<()> {
        let params = scrobble_params(track, &self.session);
        let response = self
            .http
            .post(self.service.base_url())
            .form(&params)
            .send()
            .context("Failed sending scrobble request")?;
        let text = response
            .text()
            .context("Failed reading scrobble response")?;
        if self.debug_response {
            eprintln!(
                "Scrobble response from {}: {}",
                self.service.base_url(),
                text
            );
        }
        check_api_error(&text)?;
        check_scrobble_result(&text)?;
        Ok(())
    }
}

impl ScrobbleSink for ScrobbleClient {
    fn submit(&self, track: &ScrobbleTrack) -> Result<()> {
        self.scrobble_track(track)
    }
}

fn scrobble_params(track: &ScrobbleTrack, session: &Session) -> Vec<(String, String)> {
    let mut params = vec![
        ("method".to_string(), "track.scrobble".to_string()),
        ("artist".to_string(), track.artist.clone()),
        ("track".to_string(), track.title.clone()),
        ("timestamp".to_string(), track.timestamp.to_string()),
        ("api_key".to_string(), session.api_key.clone()),
        ("sk".to_string(), session.session_key.clone()),
    ];
    if let Some(album) = &track.album {
        params.push(("album".to_string(), album.clone()));
    }
    let api_sig = sign_params(&params, &session.api_secret);
    params.push(("api_sig".to_string(), api_sig));
    params.push(("format".to_string(), "json".to_string()));
    params
}

fn fetch_mobile_session(
    http: &Client,
    service: Service,
    api_key: &str,
    api_secret: &str,
    account: &Account,
) -> Result<String> {
    let auth_token = format!(
        "{:x}",
        md5::compute(format!("{}{}", account.username, account.password_md5))
    );
    let mut params = vec![
        ("method".to_string(), "auth.getMobileSession".to_string()),
        ("username".to_string(), account.username.clone()),
        ("authToken".to_string(), auth_token),
        ("api_key".to_string(), api_key.to_string()),
    ];
    let api_sig = sign_params(&params, api_secret);
    params.push(("api_sig".to_string(), api_sig));
    params.push(("format".to_string(), "json".to_string()));
    let response = http
        .post(service.base_url())
        .form(&params)
        .send()
        .context("Failed requesting mobile session")?;
    let text = response.text().context("Failed reading session response")?;
    check_api_error(&text)?;
    let json: Value = serde_json::from_str(&text).context("Failed parsing session response")?;
    let key = json
        .pointer("/session/key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Missing session key in response"))?;
    Ok(key)
}

fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut signature = String::new();
    for (key, value) in sorted {
        signature.push_str(&key);
        signature.push_str(&value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature))
}

fn check_api_error(payload: &str) -> Result<()> {
    let json: Value = serde_json::from_str(payload).context("Failed parsing API response")?;
    if let Some(error) = json.get("error") {
        let code = error
            .as_u64()
            .or_else(|| error.as_str().and_then(|raw| raw.parse().ok()))
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(0);
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("API error")
            .to_string();
        return Err(ApiError::Api { code, message }.into());
    }
    Ok(())
}

fn check_scrobble_result(payload: &str) -> Result<()> {
    let parsed: ScrobbleResponse =
        serde_json::from_str(payload).context("Failed parsing scrobble response")?;
    let Some(scrobbles) = parsed.scrobbles.as_ref() else {
        return Ok(());
    };
    let accepted = scrobbles.attr.as_ref().map_or(0, |attr| attr.accepted);
    let ignored = scrobbles.attr.as_ref().map_or(0, |attr| attr.ignored);
    if accepted > 0 && ignored == 0 {
        return Ok(());
    }
    let ignored = scrobbles
        .scrobble
        .as_ref()
        .and_then(ScrobbleEntries::first_ignored_message);
    let (code, message) = match ignored {
        Some(IgnoredMessageField::Object(message)) => (
            message.code.clone().unwrap_or_else(|| "unknown".to_string()),
            message
                .text
                .clone()
                .unwrap_or_else(|| "Scrobble rejected".to_string()),
        ),
        Some(IgnoredMessageField::Text(message)) => ("unknown".to_string(), message.clone()),
        Some(IgnoredMessageField::Number(code)) => (code.to_string(), "Scrobble rejected".to_string()),
        None => ("unknown".to_string(), "Scrobble rejected".to_string()),
    };
    // 91: already scrobbled with this timestamp.
    if code == "91" {
        log::debug!("Scrobble already recorded by the service");
        return Ok(());
    }
    Err(ApiError::Rejected { code, message }.into())
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponse {
    #[serde(default)]
    scrobbles: Option<Scrobbles>,
}

#[derive(Debug, Deserialize)]
struct Scrobbles {
    #[serde(rename = "@attr")]
    #[serde(default)]
    attr: Option<ScrobbleAttr>,
    #[serde(default)]
    scrobble: Option<ScrobbleEntries>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleAttr {
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    accepted: u32,
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    ignored: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    // Listed first: a derived struct also deserializes from a sequence.
    Many(Vec<ScrobbleEntry>),
    One(ScrobbleEntry),
}

impl ScrobbleEntries {
    fn first_ignored_message(&self) -> Option<&IgnoredMessageField> {
        match self {
            ScrobbleEntries::One(entry) => entry.ignored_message.as_ref(),
            ScrobbleEntries::Many(entries) => entries
                .first()
                .and_then(|entry| entry.ignored_message.as_ref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntry {
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessageField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IgnoredMessageField {
    Object(IgnoredMessage),
    Text(String),
    Number(u32),
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn deserialize_u32_string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU32 {
        String(String),
        Number(u32),
    }
    match StringOrU32::deserialize(deserializer)? {
        StringOrU32::String(value) => value.parse::<u32>().map_err(serde::de::Error::custom),
        StringOrU32::Number(value) => Ok(value),
    }
}
