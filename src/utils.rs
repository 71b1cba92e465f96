use chrono::{DateTime, Utc};
use url::Url;

use crate::error::TransportError;

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Realtime endpoint for an API base url: same host, `ws`/`wss` matching the
/// http scheme, token and language as query parameters.
pub fn ws_url(api_base_url: &str, token: &str, lang: &str) -> Result<Url, TransportError> {
    let base = normalize_url(api_base_url);
    let (proto, host) = match base.strip_prefix("https://") {
        Some(rest) => ("wss", rest),
        None => ("ws", base.trim_start_matches("http://")),
    };
    let mut url = Url::parse(&format!("{}://{}/ws", proto, host))?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("lang", lang);
    Ok(url)
}

pub fn new_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
