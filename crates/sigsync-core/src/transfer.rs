//! Remote transfer client: thin wrapper around the server's file-transfer
//! API.
//!
//! The engine only talks to the network through the [`RemoteTransfer`]
//! trait; [`HttpTransfer`] is the curl-backed production implementation,
//! tests substitute their own. All calls are synchronous from the worker's
//! perspective.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::PlayerConfig;
use crate::manifest::FileType;
use crate::storage;

/// Error from a single transfer call. Network and HTTP failures are the
/// expected kinds; storage failures surface when the destination disk
/// rejects the payload.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP {0}")]
    Http(u32),
    #[error(transparent)]
    Network(#[from] curl::Error),
    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    Partial { expected: u64, received: u64 },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// The network calls the engine consumes. One authoritative server, one
/// configured base endpoint; credentials travel with every call.
pub trait RemoteTransfer: Send + Sync {
    /// Fetch a rendered resource (widget HTML) as one payload.
    fn fetch_resource(
        &self,
        layout_id: i64,
        region_id: &str,
        media_id: &str,
    ) -> Result<String, TransferError>;

    /// Fetch `[offset, offset + length)` of a server-side file.
    fn fetch_file_chunk(
        &self,
        file_id: i64,
        file_type: FileType,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransferError>;

    /// Stream a plain HTTP URL to `dest` (an absolute path).
    fn fetch_http(&self, url: &str, dest: &Path) -> Result<(), TransferError>;

    /// Fire-and-forget status report; failures are logged, never returned.
    fn notify_status(&self, payload: &serde_json::Value);
}

/// Build the URL for an engine call against the configured endpoint.
fn call_url(endpoint: &str, call: &str, params: &[(&str, String)]) -> Result<Url, TransferError> {
    let base = format!("{}/{}", endpoint.trim_end_matches('/'), call);
    let url = Url::parse_with_params(&base, params.iter().map(|(k, v)| (*k, v.as_str())))?;
    Ok(url)
}

/// Production transfer client over HTTP, one curl Easy handle per call.
pub struct HttpTransfer {
    endpoint: String,
    server_key: String,
    hardware_key: String,
    connect_timeout: Duration,
    transfer_timeout: Duration,
}

impl HttpTransfer {
    pub fn from_config(cfg: &PlayerConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            server_key: cfg.server_key.clone(),
            hardware_key: cfg.hardware_key.clone(),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            transfer_timeout: Duration::from_secs(cfg.transfer_timeout_secs),
        }
    }

    fn keys(&self) -> [(&'static str, String); 2] {
        [
            ("serverKey", self.server_key.clone()),
            ("hardwareKey", self.hardware_key.clone()),
        ]
    }

    fn configure(&self, easy: &mut curl::easy::Easy) -> Result<(), TransferError> {
        easy.follow_location(true)?;
        easy.connect_timeout(self.connect_timeout)?;
        // Low-speed abort keeps a stalled transfer from hanging a worker
        // forever without killing slow-but-live links.
        easy.low_speed_limit(1024)?;
        easy.low_speed_time(Duration::from_secs(60))?;
        easy.timeout(self.transfer_timeout)?;
        Ok(())
    }

    /// GET `url` and collect the body in memory.
    fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, TransferError> {
        let mut body = Vec::new();
        let mut easy = curl::easy::Easy::new();
        easy.url(url.as_str())?;
        self.configure(&mut easy)?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| {
                body.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform()?;
        }
        let code = easy.response_code()? as u32;
        if !(200..300).contains(&code) {
            return Err(TransferError::Http(code));
        }
        Ok(body)
    }
}

impl RemoteTransfer for HttpTransfer {
    fn fetch_resource(
        &self,
        layout_id: i64,
        region_id: &str,
        media_id: &str,
    ) -> Result<String, TransferError> {
        let mut params: Vec<(&str, String)> = self.keys().to_vec();
        params.push(("layoutId", layout_id.to_string()));
        params.push(("regionId", region_id.to_string()));
        params.push(("mediaId", media_id.to_string()));
        let url = call_url(&self.endpoint, "resource", &params)?;
        let body = self.get_bytes(&url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn fetch_file_chunk(
        &self,
        file_id: i64,
        file_type: FileType,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransferError> {
        let mut params: Vec<(&str, String)> = self.keys().to_vec();
        params.push(("fileId", file_id.to_string()));
        params.push(("fileType", file_type.as_str().to_string()));
        params.push(("chunkOffset", offset.to_string()));
        params.push(("chunkSize", length.to_string()));
        let url = call_url(&self.endpoint, "file", &params)?;
        self.get_bytes(&url)
    }

    fn fetch_http(&self, url: &str, dest: &Path) -> Result<(), TransferError> {
        let parsed = Url::parse(url)?;
        let tmp = storage::temp_path(dest);
        let file = File::create(&tmp)?;

        let written = Arc::new(Mutex::new((file, 0u64, None::<std::io::Error>)));
        let written_cb = Arc::clone(&written);

        let mut easy = curl::easy::Easy::new();
        easy.url(parsed.as_str())?;
        self.configure(&mut easy)?;

        let result = (|| -> Result<(), TransferError> {
            {
                let mut transfer = easy.transfer();
                transfer.write_function(move |data| {
                    let mut guard = written_cb.lock().unwrap();
                    let (file, count, err) = &mut *guard;
                    match file.write_all(data) {
                        Ok(()) => {
                            *count += data.len() as u64;
                            Ok(data.len())
                        }
                        Err(e) => {
                            // Abort the transfer; the stored error wins over
                            // curl's generic write-error code.
                            *err = Some(e);
                            Ok(0)
                        }
                    }
                })?;
                if let Err(e) = transfer.perform() {
                    if e.is_write_error() {
                        if let Some(io_err) = written.lock().unwrap().2.take() {
                            return Err(TransferError::Storage(io_err));
                        }
                    }
                    return Err(TransferError::Network(e));
                }
            }
            let code = easy.response_code()? as u32;
            if !(200..300).contains(&code) {
                return Err(TransferError::Http(code));
            }
            let received = written.lock().unwrap().1;
            let expected = easy.content_length_download().unwrap_or(-1.0);
            if expected >= 0.0 && received != expected as u64 {
                return Err(TransferError::Partial {
                    expected: expected as u64,
                    received,
                });
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                std::fs::rename(&tmp, dest)?;
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn notify_status(&self, payload: &serde_json::Value) {
        let result = (|| -> Result<(), TransferError> {
            let url = call_url(&self.endpoint, "status", &self.keys().to_vec())?;
            let body = payload.to_string();
            let mut easy = curl::easy::Easy::new();
            easy.url(url.as_str())?;
            self.configure(&mut easy)?;
            easy.post(true)?;
            easy.post_fields_copy(body.as_bytes())?;
            let mut headers = curl::easy::List::new();
            headers.append("Content-Type: application/json")?;
            easy.http_headers(headers)?;
            easy.perform()?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!("status notification failed: {}", e);
        }
    }
}
