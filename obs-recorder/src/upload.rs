//! Track upload to an OpenBikeSensor portal.
//!
//! One multipart `POST <portal>/api/tracks` per recording, with the file in a
//! single part named `body` and the user key in the `Authorization` header.
//! Any 2xx status counts as success; otherwise the response body is handed
//! back as-is.

use std::path::{Path, PathBuf};

use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Portal URL and user key must be configured")]
    NotConfigured,
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Upload failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Portal rejected the upload ({status}): {body}")]
    Rejected { status: u16, body: String },
}

pub struct PortalClient {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl PortalClient {
    pub fn new(base_url: &str, key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        }
    }

    /// Client from the configured portal, if both URL and key are set.
    pub fn from_settings(
        portal_url: Option<&str>,
        portal_key: Option<&str>,
    ) -> Result<Self, UploadError> {
        match (portal_url, portal_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
                Ok(Self::new(url, key))
            }
            _ => Err(UploadError::NotConfigured),
        }
    }

    pub fn tracks_url(&self) -> String {
        format!("{}/api/tracks", self.base_url)
    }

    pub fn build_request(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<reqwest::Request, UploadError> {
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = Form::new().part("body", part);
        let request = self
            .client
            .post(self.tracks_url())
            .header(AUTHORIZATION, format!("OBSUserId {}", self.key))
            .multipart(form)
            .build()?;
        Ok(request)
    }

    /// Upload a recording. Returns the portal's response body.
    pub async fn upload(&self, path: &Path) -> Result<String, UploadError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());

        debug!("Uploading {} ({} bytes) to {}", file_name, bytes.len(), self.tracks_url());
        let request = self.build_request(&file_name, bytes)?;
        let response = self.client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            info!("Uploaded {}", file_name);
            Ok(body)
        } else {
            Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let client = PortalClient::new("https://portal.example/", "secret");
        let request = client
            .build_request("obs-20261017-091245.bin", vec![1, 2, 0])
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://portal.example/api/tracks");
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "OBSUserId secret"
        );
        let content_type = request
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
    }

    #[test]
    fn test_needs_url_and_key() {
        assert!(matches!(
            PortalClient::from_settings(Some("https://portal.example"), None),
            Err(UploadError::NotConfigured)
        ));
        assert!(matches!(
            PortalClient::from_settings(Some(""), Some("key")),
            Err(UploadError::NotConfigured)
        ));
        assert!(PortalClient::from_settings(Some("https://portal.example"), Some("key")).is_ok());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = PortalClient::new("http://127.0.0.1:9", "key");
        let err = client.upload(&dir.path().join("nope.bin")).await.unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }
}
