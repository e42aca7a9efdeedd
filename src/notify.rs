use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;

use crate::error::PushError;

const API_BASE_URL: &str = "https://api.pushbullet.com/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking Pushbullet client.
///
/// HTTP status errors are handled manually so the service's own error
/// description can be lifted out of the response body.
pub struct Pushbullet {
    agent: ureq::Agent,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    file_name: String,
    file_type: String,
    file_url: String,
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl Pushbullet {
    pub fn new(access_token: impl Into<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .new_agent();

        Self {
            agent,
            access_token: access_token.into(),
        }
    }

    pub fn push_note(&self, title: &str, body: &str) -> Result<(), PushError> {
        self.post_json(
            "pushes",
            json!({ "type": "note", "title": title, "body": body }),
        )?;
        Ok(())
    }

    pub fn push_link(&self, title: &str, url: &str, body: &str) -> Result<(), PushError> {
        self.post_json(
            "pushes",
            json!({ "type": "link", "title": title, "url": url, "body": body }),
        )?;
        Ok(())
    }

    /// Upload a file and push it: request an upload slot, post the bytes as
    /// multipart form data to the returned URL, then push the stored file.
    pub fn push_file(&self, path: &Path, body: &str) -> Result<(), PushError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment");
        let file_type = guess_mime(path);
        let bytes = fs::read(path)
            .map_err(|e| PushError::Attachment(format!("{}: {e}", path.display())))?;

        let mut response = self.post_json(
            "upload-requests",
            json!({ "file_name": file_name, "file_type": file_type }),
        )?;
        let upload: UploadRequest = response
            .body_mut()
            .read_json()
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let boundary = make_boundary();
        let form = multipart_file(&boundary, "file", &upload.file_name, &upload.file_type, &bytes);
        let uploaded = self
            .agent
            .post(&upload.upload_url)
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .send(&form[..])
            .map_err(|e| PushError::Transport(e.to_string()))?;
        ensure_success(uploaded)?;

        self.post_json(
            "pushes",
            json!({
                "type": "file",
                "file_name": upload.file_name,
                "file_type": upload.file_type,
                "file_url": upload.file_url,
                "body": body,
            }),
        )?;
        Ok(())
    }

    fn post_json(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<ureq::http::Response<ureq::Body>, PushError> {
        let response = self
            .agent
            .post(format!("{API_BASE_URL}/{endpoint}"))
            .header("Access-Token", &self.access_token)
            .send_json(&payload)
            .map_err(|e| PushError::Transport(e.to_string()))?;
        ensure_success(response)
    }
}

fn ensure_success(
    mut response: ureq::http::Response<ureq::Body>,
) -> Result<ureq::http::Response<ureq::Body>, PushError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .body_mut()
        .read_json::<ErrorEnvelope>()
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| format!("HTTP {status}"));
    Err(PushError::Api(message))
}

fn guess_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

fn make_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("----doorbell-{:08x}{:08x}", std::process::id(), nanos)
}

fn multipart_file(
    boundary: &str,
    field: &str,
    file_name: &str,
    file_type: &str,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {file_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
