//! REST API Client
//!
//! Request/response interactions with the server's JSON API. Credentials
//! are cookie-bound and included on every request; the /hosts and /pair
//! endpoints stream newline-delimited JSON (first record is the header,
//! the rest are incremental updates).

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Total request timeout, slightly above the backend's per-host timeout.
pub const API_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("unauthorized")]
    Unauthorized,
    #[error("host not reachable")]
    HostNotReachable,
    #[error("http status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
}

fn map_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transport(err)
    }
}

fn check_status(status: StatusCode) -> Result<(), ApiError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Status(status.as_u16()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostInfo {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppEntry {
    pub id: u32,
    pub title: String,
}

/// Records of the /hosts newline-delimited stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HostsRecord {
    Header { hosts: Vec<HostInfo> },
    Update { host: HostInfo },
}

/// Records of the /pair newline-delimited stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PairRecord {
    Header { pin: String },
    Update { status: String },
}

/// Incremental reader over a newline-delimited JSON body.
pub struct NdjsonStream<T> {
    inner: futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    done: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> NdjsonStream<T> {
    fn new(response: reqwest::Response) -> Self {
        Self {
            inner: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Next record, or `None` once the stream ends.
    pub async fn next(&mut self) -> Result<Option<T>, ApiError> {
        loop {
            if let Some(record) = take_line(&mut self.buffer)? {
                return Ok(Some(record));
            }
            if self.done {
                return flush_remainder(&mut self.buffer);
            }
            match self.inner.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk.map_err(map_error)?),
                None => self.done = true,
            }
        }
    }
}

/// Pop one complete line from the buffer and parse it. Blank lines skip.
fn take_line<T: DeserializeOwned>(buffer: &mut Vec<u8>) -> Result<Option<T>, ApiError> {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let record =
            serde_json::from_slice(line).map_err(|e| ApiError::Malformed(e.to_string()))?;
        return Ok(Some(record));
    }
    Ok(None)
}

/// Trailing record without a newline terminator.
fn flush_remainder<T: DeserializeOwned>(buffer: &mut Vec<u8>) -> Result<Option<T>, ApiError> {
    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        buffer.clear();
        return Ok(None);
    }
    let line = std::mem::take(buffer);
    let record =
        serde_json::from_slice(&line).map_err(|e| ApiError::Malformed(e.to_string()))?;
    Ok(Some(record))
}

/// REST client bound to one server origin.
pub struct ApiClient {
    client: Client,
    base: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        // Validate the origin up front; requests use plain concatenation.
        Url::parse(base_url).map_err(|e| ApiError::Malformed(e.to_string()))?;
        let client = Client::builder()
            .cookie_store(true)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(ApiError::Transport)?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(map_error)?;
        check_status(response.status())?;
        response.json().await.map_err(map_error)
    }

    async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(map_error)?;
        check_status(response.status())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        info!("logging in as {username}");
        let response = self
            .client
            .post(self.url("/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(map_error)?;
        check_status(response.status())
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.post_empty("/logout").await
    }

    /// Probe whether the cookie-bound credentials are still valid.
    pub async fn authenticate(&self) -> Result<UserInfo, ApiError> {
        self.get_json("/authenticate").await
    }

    pub async fn user(&self) -> Result<UserInfo, ApiError> {
        self.get_json("/user").await
    }

    pub async fn users(&self) -> Result<Vec<UserInfo>, ApiError> {
        self.get_json("/users").await
    }

    pub async fn host(&self, host_id: u32) -> Result<HostInfo, ApiError> {
        self.get_json(&format!("/host?host_id={host_id}")).await
    }

    /// Stream host list updates (header first, then increments).
    pub async fn hosts(&self) -> Result<NdjsonStream<HostsRecord>, ApiError> {
        let response = self
            .client
            .get(self.url("/hosts"))
            .send()
            .await
            .map_err(map_error)?;
        check_status(response.status())?;
        Ok(NdjsonStream::new(response))
    }

    /// Start pairing; the stream yields the PIN header then status updates.
    pub async fn pair(&self, host_id: u32) -> Result<NdjsonStream<PairRecord>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/pair?host_id={host_id}")))
            .send()
            .await
            .map_err(map_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::HostNotReachable);
        }
        check_status(response.status())?;
        Ok(NdjsonStream::new(response))
    }

    pub async fn wake_host(&self, host_id: u32) -> Result<(), ApiError> {
        debug!("waking host {host_id}");
        self.post_empty(&format!("/host/wake?host_id={host_id}"))
            .await
    }

    pub async fn apps(&self, host_id: u32) -> Result<Vec<AppEntry>, ApiError> {
        self.get_json(&format!("/apps?host_id={host_id}")).await
    }

    pub async fn app_image(&self, host_id: u32, app_id: u32) -> Result<Bytes, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/app/image?host_id={host_id}&app_id={app_id}")))
            .send()
            .await
            .map_err(map_error)?;
        check_status(response.status())?;
        response.bytes().await.map_err(map_error)
    }

    /// Cancel the running app on a host.
    pub async fn cancel(&self, host_id: u32) -> Result<(), ApiError> {
        let result = self
            .post_empty(&format!("/host/cancel?host_id={host_id}"))
            .await;
        if let Err(ref err) = result {
            warn!("cancel failed: {err}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR),
            Err(ApiError::Status(500))
        ));
    }

    #[test]
    fn ndjson_line_splitting() {
        let mut buffer = br#"{"hosts":[{"id":1,"name":"desk"}]}
{"host":{"id":1,"name":"desk","online":true}}
"#
        .to_vec();

        let first: HostsRecord = take_line(&mut buffer).unwrap().unwrap();
        assert!(matches!(first, HostsRecord::Header { hosts } if hosts.len() == 1));

        let second: HostsRecord = take_line(&mut buffer).unwrap().unwrap();
        match second {
            HostsRecord::Update { host } => {
                assert!(host.online);
                assert_eq!(host.id, 1);
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let none: Option<HostsRecord> = take_line(&mut buffer).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn ndjson_partial_line_waits() {
        let mut buffer = br#"{"pin":"12"#.to_vec();
        let none: Option<PairRecord> = take_line(&mut buffer).unwrap();
        assert!(none.is_none());

        buffer.extend_from_slice(b"34\"}\n");
        let record: PairRecord = take_line(&mut buffer).unwrap().unwrap();
        assert!(matches!(record, PairRecord::Header { pin } if pin == "1234"));
    }

    #[test]
    fn ndjson_remainder_without_newline() {
        let mut buffer = br#"{"status":"Paired"}"#.to_vec();
        let record: PairRecord = flush_remainder(&mut buffer).unwrap().unwrap();
        assert!(matches!(record, PairRecord::Update { status } if status == "Paired"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn malformed_record_is_an_error() {
        let mut buffer = b"not json\n".to_vec();
        let result: Result<Option<PairRecord>, _> = take_line(&mut buffer);
        assert!(matches!(result, Err(ApiError::Malformed(_))));
    }
}
