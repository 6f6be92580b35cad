use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::HttpSettings;
use crate::error::{AppError, Result};

/// Upper bound on a single extracted archive member.
const MAX_MEMBER_BYTES: u64 = 4 * 1024 * 1024;

pub fn client(settings: &HttpSettings) -> Result<Client> {
    Ok(Client::builder()
        .user_agent(settings.user_agent.as_str())
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?)
}

/// GET `url` and decode a JSON body, reporting API error messages on non-2xx.
pub fn get_json<T: DeserializeOwned>(client: &Client, url: &str, action: &str) -> Result<T> {
    let resp = client.get(url).send()?;
    let status = resp.status();
    let body = resp.text()?;
    if !status.is_success() {
        return Err(AppError::Other(format!(
            "{action} failed ({}): {}",
            status,
            extract_api_error(&body)
        )));
    }
    serde_json::from_str::<T>(&body)
        .map_err(|e| AppError::Other(format!("failed to parse {} response: {}", action, e)))
}

fn extract_api_error(body: &str) -> String {
    if body.trim().is_empty() {
        return "empty response body".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "Error", "code"] {
            if let Some(v) = value.get(key) {
                if let Some(s) = v.as_str() {
                    return s.to_string();
                }
                return v.to_string();
            }
        }
    }
    body.to_string()
}

/// Fetches an archive and returns its members keyed by path.
pub trait Unzipper: Send + Sync {
    fn fetch_and_extract(&self, url: &str) -> Result<BTreeMap<String, Vec<u8>>>;
}

pub struct HttpUnzipper {
    client: Client,
}

impl HttpUnzipper {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Unzipper for HttpUnzipper {
    fn fetch_and_extract(&self, url: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let resp = self.client.get(url).send()?.error_for_status()?;
        let bytes = resp.bytes()?;
        debug!(url, bytes = bytes.len(), "archive_downloaded");
        extract_zip(&bytes)
    }
}

/// Extract the regular files of a zip archive held in memory.
pub fn extract_zip(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| AppError::Catalog(format!("invalid zip archive: {e}")))?;
    let mut members = BTreeMap::new();
    for i in 0..archive.len() {
        let file = archive
            .by_index(i)
            .map_err(|e| AppError::Catalog(format!("zip member {i}: {e}")))?;
        if !file.is_file() {
            continue;
        }
        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.take(MAX_MEMBER_BYTES).read_to_end(&mut contents)?;
        members.insert(name, contents);
    }
    Ok(members)
}

#[cfg(test)]
pub(crate) fn build_zip(members: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in members {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
