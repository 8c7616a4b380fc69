use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;
use thiserror::Error;

const HISTORY_URL: &str = "https://music.youtube.com/history";
const REQUIRED_COOKIE: &str = "__Secure-3PAPISID";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";
const HISTORY_MARKERS: &[&str] = &[
    "singleColumnBrowseResultsRenderer",
    "musicShelfRenderer",
    "FEmusic_history",
];
const ARTIST_PAGE: &str = "MUSIC_PAGE_TYPE_ARTIST";
const ALBUM_PAGE: &str = "MUSIC_PAGE_TYPE_ALBUM";

static INITIAL_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"initialData\.push\(\{[^}]*data:\s*'([^']+)'").expect("valid initialData pattern")
});
static UNICODE_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u([0-9A-Fa-f]{4})").expect("valid unicode escape pattern"));

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Cookie is missing the required __Secure-3PAPISID token; copy the complete cookie from your browser")]
    IncompleteCookie,
    #[error("401 UNAUTHENTICATED: YouTube Music credentials have expired")]
    Unauthenticated,
    #[error("Failed fetching history page: {status}")]
    Status { status: StatusCode, body: String },
    #[error("No initial data found in page; the cookie may not be signed in")]
    NoInitialData,
    #[error("No history shelves found in page data")]
    NoResults,
}

/// One list item from the history page, as extracted. Fields are `None`
/// when the page did not carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    /// Title of the shelf the item sits under, e.g. "Today".
    pub date_label: Option<String>,
    pub position: i64,
}

pub trait HistorySource {
    fn fetch_history(&self) -> Result<Vec<HistoryEntry>>;
}

pub struct YtMusicClient {
    http: Client,
    cookie: String,
}

impl YtMusicClient {
    pub fn new(cookie: &str) -> Result<Self> {
        let cookie = request_cookie(cookie)?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self { http, cookie })
    }

    fn fetch_page(&self) -> Result<String> {
        let response = self
            .http
            .get(HISTORY_URL)
            .header(
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("accept-language", "en-US,en;q=0.9")
            .header("cache-control", "no-cache")
            .header("cookie", &self.cookie)
            .send()
            .context("Failed requesting YouTube Music history")?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(HistoryError::Unauthenticated.into());
        }
        let body = response
            .text()
            .context("Failed reading YouTube Music history page")?;
        if !status.is_success() {
            return Err(HistoryError::Status { status, body }.into());
        }
        Ok(body)
    }
}

impl HistorySource for YtMusicClient {
    fn fetch_history(&self) -> Result<Vec<HistoryEntry>> {
        let page = self.fetch_page()?;
        let entries = extract_history(&page)?;
        log::info!("Extracted {} history entries", entries.len());
        Ok(entries)
    }
}

/// Cleans a browser cookie for use as a header value.
pub fn request_cookie(raw: &str) -> Result<String, HistoryError> {
    if !raw.contains(&format!("{REQUIRED_COOKIE}=")) {
        return Err(HistoryError::IncompleteCookie);
    }
    let stripped: String = raw.chars().filter(|ch| u32::from(*ch) <= 0xFF).collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut pairs: Vec<(String, String)> = Vec::new();
    for pair in collapsed.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        match pairs.iter_mut().find(|(existing, _)| existing == name) {
            Some(existing) => existing.1 = value.to_string(),
            None => pairs.push((name.to_string(), value.to_string())),
        }
    }
    if !pairs.iter().any(|(name, _)| name == "SOCS") {
        pairs.push(("SOCS".to_string(), "CAI".to_string()));
    }
    Ok(pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; "))
}

/// Parses the history list out of the page's embedded `initialData` payloads.
pub fn extract_history(page: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
    let data = find_initial_data(page).ok_or(HistoryError::NoInitialData)?;
    parse_history(&data)
}

fn find_initial_data(page: &str) -> Option<Value> {
    for capture in INITIAL_DATA.captures_iter(page) {
        let decoded = decode_hex_escapes(&capture[1]);
        let trimmed = decoded.trim();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            continue;
        }
        if !HISTORY_MARKERS.iter().any(|marker| trimmed.contains(marker)) {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(trimmed)
            .or_else(|_| serde_json::from_str::<Value>(&repair_quotes(trimmed)))
            .or_else(|_| serde_json::from_str::<Value>(&balance_brackets(trimmed)));
        match parsed {
            Ok(value) => return Some(value),
            Err(err) => log::debug!("Skipping unparseable initialData payload: {err}"),
        }
    }
    None
}

fn parse_history(data: &Value) -> Result<Vec<HistoryEntry>, HistoryError> {
    let sections = data
        .pointer("/contents/singleColumnBrowseResultsRenderer/tabs/0/tabRenderer/content/sectionListRenderer/contents")
        .and_then(Value::as_array)
        .filter(|sections| !sections.is_empty())
        .ok_or(HistoryError::NoResults)?;

    let mut entries = Vec::new();
    let mut position = 0;
    for section in sections {
        let Some(shelf) = section.get("musicShelfRenderer") else {
            continue;
        };
        let date_label = shelf
            .pointer("/title/runs/0/text")
            .and_then(Value::as_str)
            .map(str::to_string);
        let items = shelf
            .get("contents")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for item in items {
            let Some(renderer) = item.get("musicResponsiveListItemRenderer") else {
                continue;
            };
            let runs = first_runs(renderer);
            let track_name = runs
                .iter()
                .find(|run| run.pointer("/navigationEndpoint/watchEndpoint").is_some())
                .and_then(|run| run_text(run));
            let artist_name = runs
                .iter()
                .find(|run| page_type(run) == Some(ARTIST_PAGE))
                .and_then(|run| run_text(run));
            let album_name = runs
                .iter()
                .find(|run| page_type(run) == Some(ALBUM_PAGE))
                .and_then(|run| run_text(run));
            entries.push(HistoryEntry {
                track_name,
                artist_name,
                album_name,
                date_label: date_label.clone(),
                position,
            });
            position += 1;
        }
    }
    Ok(entries)
}

/// First text run of every flex column.
fn first_runs(renderer: &Value) -> Vec<&Value> {
    renderer
        .get("flexColumns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .filter_map(|column| {
                    column.pointer("/musicResponsiveListItemFlexColumnRenderer/text/runs/0")
                })
                .collect()
        })
        .unwrap_or_default()
}

fn page_type(run: &Value) -> Option<&str> {
    run.pointer(
        "/navigationEndpoint/browseEndpoint/browseEndpointContextSupportedConfigs/browseEndpointContextMusicConfig/pageType",
    )
    .and_then(Value::as_str)
}

fn run_text(run: &Value) -> Option<String> {
    run.get("text")
        .and_then(Value::as_str)
        .map(sanitize_text)
        .filter(|text| !text.trim().is_empty())
}

/// Decodes `\xNN` escapes, treating the result as UTF-8 bytes.
fn decode_hex_escapes(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' && bytes.get(index + 1) == Some(&b'x') {
            let hex = bytes
                .get(index + 2..index + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                index += 4;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escapes quotes inside strings that are not followed by a JSON delimiter.
fn repair_quotes(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (index, ch) in chars.iter().copied().enumerate() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        if ch == '\\' {
            out.push(ch);
            escaped = true;
            continue;
        }
        match in_string {
            None => {
                if ch == '"' || ch == '\'' {
                    in_string = Some(ch);
                }
                out.push(ch);
            }
            Some(quote) if ch == quote => {
                let next = chars[index + 1..].iter().find(|next| !next.is_whitespace());
                let closes = next.is_none_or(|next| matches!(next, ',' | '}' | ']' | ':'));
                if closes {
                    in_string = None;
                } else {
                    out.push('\\');
                }
                out.push(ch);
            }
            Some(_) => out.push(ch),
        }
    }
    out
}

/// Drops a trailing comma and closes whatever strings, arrays and objects
/// a truncated payload left open, innermost first.
fn balance_brackets(raw: &str) -> String {
    let mut cleaned = raw.trim().trim_end_matches(',').to_string();
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in cleaned.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }
    if in_string {
        cleaned.push('"');
    }
    while let Some(close) = open.pop() {
        cleaned.push(close);
    }
    cleaned
}

/// Normalises typographic punctuation and strips control characters.
pub fn sanitize_text(raw: &str) -> String {
    let unescaped = UNICODE_ESCAPE.replace_all(raw, |caps: &regex::Captures<'_>| {
        u32::from_str_radix(&caps[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map_or_else(|| caps[0].to_string(), String::from)
    });
    let mut out = String::with_capacity(unescaped.len());
    for ch in unescaped.chars() {
        match ch {
            '\u{2026}' => out.push_str("..."),
            '\u{2013}' | '\u{2014}' => out.push('-'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201C}' | '\u{201D}' => out.push('"'),
            '\u{0000}'..='\u{001F}' | '\u{007F}' | '\u{FFFE}' | '\u{FFFF}' => {}
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(title: &str, artist: Option<&str>, album: Option<&str>) -> Value {
        let mut columns = vec![json!({
            "musicResponsiveListItemFlexColumnRenderer": {"text": {"runs": [{
                "text": title,
                "navigationEndpoint": {"watchEndpoint": {"videoId": "abc"}}
            }]}}
        })];
        for (name, page) in [(artist, ARTIST_PAGE), (album, ALBUM_PAGE)] {
            if let Some(name) = name {
                columns.push(json!({
                    "musicResponsiveListItemFlexColumnRenderer": {"text": {"runs": [{
                        "text": name,
                        "navigationEndpoint": {"browseEndpoint": {
                            "browseEndpointContextSupportedConfigs": {
                                "browseEndpointContextMusicConfig": {"pageType": page}
                            }
                        }}
                    }]}}
                }));
            }
        }
        json!({"musicResponsiveListItemRenderer": {"flexColumns": columns}})
    }

    fn shelf(label: &str, items: Vec<Value>) -> Value {
        json!({"musicShelfRenderer": {
            "title": {"runs": [{"text": label}]},
            "contents": items
        }})
    }

    fn history_payload(shelves: Vec<Value>) -> Value {
        json!({"contents": {"singleColumnBrowseResultsRenderer": {"tabs": [{
            "tabRenderer": {"content": {"sectionListRenderer": {"contents": shelves}}}
        }]}}})
    }

    fn hex_escape(raw: &str) -> String {
        raw.bytes()
            .map(|byte| {
                if byte.is_ascii_alphanumeric() || byte == b' ' {
                    (byte as char).to_string()
                } else {
                    format!("\\x{byte:02x}")
                }
            })
            .collect()
    }

    fn page(payload: &Value) -> String {
        format!(
            "<html><script>initialData.push({{path: '\\/guide', params: JSON.parse('\\x7b\\x7d'), data: '{}'}});\
             initialData.push({{path: '\\/browse', params: JSON.parse('\\x7b\\x7d'), data: '{}'}});</script></html>",
            hex_escape(r#"{"responseContext":{}}"#),
            hex_escape(&payload.to_string())
        )
    }

    #[test]
    fn extracts_entries_across_shelves() {
        let payload = history_payload(vec![
            shelf(
                "Today",
                vec![
                    item("Impossible Germany", Some("Wilco"), Some("Sky Blue Sky")),
                    item("Song", Some("Band - Topic"), None),
                ],
            ),
            shelf("Yesterday", vec![item("Hate It Here", Some("Wilco"), None)]),
        ]);
        let entries = extract_history(&page(&payload)).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].track_name.as_deref(), Some("Impossible Germany"));
        assert_eq!(entries[0].artist_name.as_deref(), Some("Wilco"));
        assert_eq!(entries[0].album_name.as_deref(), Some("Sky Blue Sky"));
        assert_eq!(entries[0].date_label.as_deref(), Some("Today"));
        assert_eq!(entries[1].artist_name.as_deref(), Some("Band - Topic"));
        assert_eq!(entries[1].album_name, None);
        assert_eq!(entries[2].date_label.as_deref(), Some("Yesterday"));
        assert_eq!(
            entries.iter().map(|entry| entry.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn keeps_position_for_items_without_metadata() {
        let payload = history_payload(vec![shelf(
            "Today",
            vec![item("", Some("Wilco"), None), item("Via Chicago", None, None)],
        )]);
        let entries = extract_history(&page(&payload)).unwrap();
        assert_eq!(entries[0].track_name, None);
        assert_eq!(entries[1].track_name.as_deref(), Some("Via Chicago"));
        assert_eq!(entries[1].artist_name, None);
        assert_eq!(entries[1].position, 1);
    }

    #[test]
    fn decodes_non_ascii_text() {
        let payload = history_payload(vec![shelf(
            "今日",
            vec![item("Sábado", Some("Björk"), Some("Ágætis byrjun"))],
        )]);
        let entries = extract_history(&page(&payload)).unwrap();
        assert_eq!(entries[0].date_label.as_deref(), Some("今日"));
        assert_eq!(entries[0].track_name.as_deref(), Some("Sábado"));
        assert_eq!(entries[0].artist_name.as_deref(), Some("Björk"));
    }

    #[test]
    fn page_without_history_payload() {
        let html = "<html><script>initialData.push({path: 'x', data: '\\x7b\\x7d'});</script></html>";
        assert!(matches!(extract_history(html), Err(HistoryError::NoInitialData)));
        assert!(matches!(extract_history("<html></html>"), Err(HistoryError::NoInitialData)));
    }

    #[test]
    fn payload_without_sections() {
        let payload = json!({"contents": {"singleColumnBrowseResultsRenderer": {"tabs": []}}});
        assert!(matches!(extract_history(&page(&payload)), Err(HistoryError::NoResults)));
    }

    #[test]
    fn repairs_truncated_payloads() {
        let payload = history_payload(vec![shelf("Today", vec![item("Kamera", Some("Wilco"), None)])]);
        let text = payload.to_string();
        let truncated = &text[..text.len() - 4];
        let html = format!("initialData.push({{path: 'x', data: '{}'}});", hex_escape(truncated));
        let entries = extract_history(&html).unwrap();
        assert_eq!(entries[0].track_name.as_deref(), Some("Kamera"));
    }

    #[test]
    fn escapes_stray_quotes() {
        let repaired = repair_quotes(r#"{"title": "12" Single", "n": 1}"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["title"], "12\" Single");
    }

    #[test]
    fn cookie_requires_sapisid() {
        assert!(matches!(
            request_cookie("SID=abc; HSID=def"),
            Err(HistoryError::IncompleteCookie)
        ));
    }

    #[test]
    fn cookie_is_cleaned_and_gets_consent() {
        let cookie = request_cookie("SID=abc;  __Secure-3PAPISID=x/y;\n HSID=d€f; SID=new").unwrap();
        assert_eq!(cookie, "SID=new; __Secure-3PAPISID=x/y; HSID=df; SOCS=CAI");
        let with_socs = request_cookie("__Secure-3PAPISID=x; SOCS=CAE").unwrap();
        assert_eq!(with_socs, "__Secure-3PAPISID=x; SOCS=CAE");
    }

    #[test]
    fn sanitizes_typography_and_control_characters() {
        assert_eq!(sanitize_text("Don\u{2019}t Stop\u{2026}"), "Don't Stop...");
        assert_eq!(sanitize_text("A \u{2014} B\u{0007}"), "A - B");
        assert_eq!(sanitize_text(r"café"), "café");
    }
}
