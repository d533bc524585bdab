//! HTTP client for the Courier metadata service.
//!
//! Two calls matter to the delivery core: the batched previous-upload
//! check before any transfer starts, and the per-file registration after
//! a successful upload. Both carry the session bearer token.

use std::collections::HashMap;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::FileEntry;
use crate::error::{DeliveryError, Result};

pub struct ApiClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize, Debug)]
struct MatchResponse {
    files: Option<HashMap<String, String>>,
}

/// Body of the post-upload registration call.
#[derive(Serialize, Debug)]
pub struct FileRegistration {
    pub name: String,
    pub name_in_bucket: String,
    pub subpath: String,
    pub size_processed: u64,
    pub checksum: String,
    pub compressed: bool,
    pub overwrite: bool,
}

impl FileRegistration {
    pub fn from_entry(entry: &FileEntry) -> Self {
        Self {
            name: entry.key.clone(),
            name_in_bucket: entry.path_remote.clone(),
            subpath: entry.subpath.to_string_lossy().replace('\\', "/"),
            size_processed: entry.size_processed,
            checksum: entry.checksum.clone(),
            compressed: entry.compressed,
            overwrite: entry.overwrite,
        }
    }
}

impl ApiClient {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// One round trip asking which catalog keys already exist remotely.
    /// Returns existing key -> registered remote path. Any transport or
    /// shape problem is fatal for the session: proceeding without
    /// knowing the collision state risks a silent overwrite.
    pub async fn match_files(
        &self,
        token: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        debug!(count = keys.len(), "checking for previously uploaded files");

        let resp = self
            .http
            .post(format!("{}/file/match", self.base_url))
            .bearer_auth(token)
            .json(&keys)
            .send()
            .await
            .map_err(|e| DeliveryError::Api(format!("file match request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Api(format!(
                "file match returned {status}: {body}"
            )));
        }

        let matched: MatchResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Api(format!("malformed file match response: {e}")))?;

        Ok(matched.files.unwrap_or_default())
    }

    /// Records a freshly uploaded file. A file is not considered
    /// delivered until this call succeeds, even if the object exists.
    pub async fn register_file(&self, token: &str, registration: &FileRegistration) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/file/new", self.base_url))
            .bearer_auth(token)
            .json(registration)
            .send()
            .await
            .map_err(|e| DeliveryError::Api(format!("registration request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Api(format!(
                "registration of '{}' returned {status}: {body}",
                registration.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_files_field_means_nothing_matched() {
        let parsed: MatchResponse = serde_json::from_str(r#"{"files": null}"#).unwrap();
        assert!(parsed.files.is_none());

        let parsed: MatchResponse =
            serde_json::from_str(r#"{"files": {"a.txt": "ab12cd_a.txt.zst.ccp"}}"#).unwrap();
        let files = parsed.files.unwrap();
        assert_eq!(files["a.txt"], "ab12cd_a.txt.zst.ccp");
    }

    #[test]
    fn registration_body_has_the_collaborator_fields() {
        let entry = FileEntry {
            key: "d/a.txt".into(),
            path_raw: "/src/d/a.txt".into(),
            subpath: "d".into(),
            size_raw: 10,
            size_processed: 42,
            compressed: false,
            path_processed: "/stage/files/d/a.txt.zst.ccp".into(),
            path_remote: "d/ab12cd_a.txt.zst.ccp".into(),
            overwrite: true,
            checksum: "deadbeef".into(),
        };

        let body = serde_json::to_value(FileRegistration::from_entry(&entry)).unwrap();
        assert_eq!(body["name"], "d/a.txt");
        assert_eq!(body["name_in_bucket"], "d/ab12cd_a.txt.zst.ccp");
        assert_eq!(body["size_processed"], 42);
        assert_eq!(body["checksum"], "deadbeef");
        assert_eq!(body["compressed"], false);
        assert_eq!(body["overwrite"], true);
    }
}
