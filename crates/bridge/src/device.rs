//! HTTP client for the controller's JSON API.
//!
//! Every request is `GET /<endpoint>?pw=<md5 of password>`. The controller
//! answers 200 for most failures and reports them through a `result` code in
//! the body, so responses go through [`classify`] before anyone sees them.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::redirect;
use serde_json::Value;
use thiserror::Error;

use crate::descriptors::ConfigDocuments;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const STATUS_ENDPOINT: &str = "ja";
pub const STATIONS_ENDPOINT: &str = "jn";
pub const PROGRAMS_ENDPOINT: &str = "jp";
pub const OPTIONS_ENDPOINT: &str = "jo";
pub const SPECIAL_STATIONS_ENDPOINT: &str = "je";

// ---------------------------------------------------------------------------
// Device result codes
// ---------------------------------------------------------------------------

pub const RESULT_SUCCESS: i64 = 1;
pub const RESULT_UNAUTHORIZED: i64 = 2;
pub const RESULT_MISMATCH: i64 = 3;
pub const RESULT_DATA_MISSING: i64 = 16;
pub const RESULT_OUT_OF_RANGE: i64 = 17;
pub const RESULT_DATA_FORMAT_ERROR: i64 = 18;
pub const RESULT_RF_CODE_ERROR: i64 = 19;
pub const RESULT_PAGE_NOT_FOUND: i64 = 32;
pub const RESULT_NOT_PERMITTED: i64 = 48;

pub fn result_code_label(code: i64) -> &'static str {
    match code {
        RESULT_SUCCESS => "success",
        RESULT_UNAUTHORIZED => "unauthorized",
        RESULT_MISMATCH => "mismatch",
        RESULT_DATA_MISSING => "data missing",
        RESULT_OUT_OF_RANGE => "out of range",
        RESULT_DATA_FORMAT_ERROR => "data format error",
        RESULT_RF_CODE_ERROR => "rf code error",
        RESULT_PAGE_NOT_FOUND => "page not found",
        RESULT_NOT_PERMITTED => "not permitted",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("server error (http {0})")]
    Server(u16),
    #[error("response body is not valid json")]
    MalformedBody,
    #[error("device rejected the password")]
    Unauthorized,
    #[error("device refused the request (result {0}: {})", result_code_label(*.0))]
    Forbidden(i64),
    #[error("device reported invalid data (result {0}: {})", result_code_label(*.0))]
    InvalidData(i64),
}

impl FetchError {
    /// Fatal errors stop polling until the configuration changes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Forbidden(_))
    }
}

/// Map an HTTP status and body onto a parsed document or an error.
///
/// A body without a `result` field is a data document and counts as success.
pub fn classify(status: u16, body: &[u8]) -> Result<Value, FetchError> {
    match status {
        200 => {}
        500..=599 => return Err(FetchError::Server(status)),
        other => return Err(FetchError::Http(other)),
    }

    let doc: Value = serde_json::from_slice(body).map_err(|_| FetchError::MalformedBody)?;

    match doc.get("result").and_then(Value::as_i64) {
        None | Some(RESULT_SUCCESS) => Ok(doc),
        Some(RESULT_UNAUTHORIZED) => Err(FetchError::Unauthorized),
        Some(code @ (RESULT_PAGE_NOT_FOUND | RESULT_NOT_PERMITTED)) => {
            Err(FetchError::Forbidden(code))
        }
        Some(code) => Err(FetchError::InvalidData(code)),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub host: String,
    pub port: Option<u16>,
    pub use_tls: bool,
    pub password: String,
    pub accept_invalid_certs: bool,
}

impl DeviceSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}", self.host),
            None => format!("{scheme}://{}", self.host),
        }
    }
}

#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
    password_hash: String,
}

impl DeviceClient {
    pub fn new(settings: &DeviceSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .redirect(redirect::Policy::limited(10))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            base_url: settings.base_url(),
            password_hash: format!("{:x}", md5::compute(settings.password.as_bytes())),
        })
    }

    async fn fetch(&self, endpoint: &str) -> Result<Value, FetchError> {
        let url = format!("{}/{endpoint}", self.base_url);
        tracing::debug!(%url, "device request");

        let resp = self
            .http
            .get(&url)
            .query(&[("pw", self.password_hash.as_str())])
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        classify(status, &body)
    }

    pub async fn fetch_status(&self) -> Result<Value, FetchError> {
        self.fetch(STATUS_ENDPOINT).await
    }

    /// Fetch the four configuration documents. The first failure aborts.
    pub async fn fetch_config(&self) -> Result<ConfigDocuments, FetchError> {
        Ok(ConfigDocuments {
            stations: self.fetch(STATIONS_ENDPOINT).await?,
            programs: self.fetch(PROGRAMS_ENDPOINT).await?,
            options: self.fetch(OPTIONS_ENDPOINT).await?,
            special: self.fetch(SPECIAL_STATIONS_ENDPOINT).await?,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
