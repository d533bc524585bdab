//! Drives a delivery: fans out workers over the catalog, applies the
//! previous-upload check, and aggregates the per-file outcomes.

use std::collections::HashMap;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::append_to_delivery_log;
use crate::catalog::FileEntry;
use crate::error::{DeliveryError, Result};
use crate::remote::{ApiClient, FileRegistration};
use crate::staging::StagingDirectory;
use crate::status::{Op, StatusTable, UploadStatus};
use crate::store::{MultipartConfig, ObjectStore};
use crate::stream::FileStream;

/// What external callers get back from a delivery.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub overwrite: bool,
    pub concurrency: usize,
    pub multipart: MultipartConfig,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            concurrency: 4,
            multipart: MultipartConfig::default(),
        }
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} - {msg}")
            .expect("progress bar template is valid")
            .progress_chars("#>-"),
    );
    bar
}

/// Applies the previous-upload check to the catalog.
///
/// Keys the metadata service already knows are dropped from the active
/// set unless the caller permits overwrite, in which case the entry
/// keeps its previously registered remote path so the object is
/// replaced in place instead of duplicated under a fresh name.
pub fn apply_previous_uploads(
    entries: Vec<FileEntry>,
    existing: &HashMap<String, String>,
    overwrite: bool,
) -> (Vec<FileEntry>, Vec<String>) {
    let mut active = Vec::new();
    let mut already_delivered = Vec::new();

    for mut entry in entries {
        match existing.get(&entry.key) {
            Some(remote) if overwrite => {
                entry.overwrite = true;
                entry.path_remote = remote.clone();
                active.push(entry);
            }
            Some(_) => already_delivered.push(entry.key),
            None => active.push(entry),
        }
    }

    (active, already_delivered)
}

fn build_report(snapshot: HashMap<String, UploadStatus>, unresolved: &[String]) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for (key, status) in snapshot {
        if status.cancel {
            let reason = match status.failed_op {
                Some(op) => format!("{}: {}", op.tag(), status.message),
                None => status.message,
            };
            report.failed.push((key, reason));
        } else if status.skipped {
            report.skipped.push(key);
        } else if status.delivered() {
            report.succeeded.push(key);
        }
    }
    for missing in unresolved {
        report
            .failed
            .push((missing.clone(), "no such file or directory".into()));
    }

    report.succeeded.sort();
    report.skipped.sort();
    report.failed.sort();
    report
}

async fn process_upload(
    api: Arc<ApiClient>,
    store: Arc<ObjectStore>,
    status: Arc<StatusTable>,
    token: String,
    mut entry: FileEntry,
    multipart: MultipartConfig,
) {
    let key = entry.key.clone();
    status.mark_started(&key);

    // An entry replacing in place is expected to collide remotely.
    if !entry.overwrite {
        match store.key_exists(&entry.path_remote).await {
            Ok((true, _)) => {
                status.skip(&key, "object already in bucket, not uploading");
                return;
            }
            Ok((false, _)) => {}
            Err(e) => {
                status.fail(&key, Some(Op::Put), e.to_string());
                return;
            }
        }
    }

    if !entry.subpath.as_os_str().is_empty() {
        let prefix = entry.subpath.to_string_lossy().replace('\\', "/");
        if let Err(e) = store.ensure_folder_marker(&prefix).await {
            status.fail(&key, Some(Op::Put), e.to_string());
            return;
        }
    }

    let mut stream = match FileStream::open(&entry.path_raw, entry.compressed).await {
        Ok(s) => s,
        Err(e) => {
            status.fail(&key, Some(Op::Stream), e.to_string());
            return;
        }
    };

    status.mark_put_started(&key);
    match store
        .put_object(&mut stream, &entry.path_remote, entry.size_raw, &multipart)
        .await
    {
        Ok(size) => {
            entry.size_processed = size;
            status.mark_put_done(&key);
        }
        Err(e) => {
            status.fail(&key, Some(Op::Put), e.to_string());
            let _ = append_to_delivery_log(
                &entry.path_raw.display().to_string(),
                &entry.path_remote,
                "FAIL",
                &e.to_string(),
            );
            return;
        }
    }

    // The digest is written back here, once the sequence is exhausted,
    // not from inside the stream.
    entry.checksum = match stream.final_digest() {
        Some(d) => d.to_string(),
        None => {
            status.fail(&key, Some(Op::Stream), "checksum unavailable after upload");
            return;
        }
    };

    // An object that exists but was never registered is not delivered.
    status.mark_register_started(&key);
    match api
        .register_file(&token, &FileRegistration::from_entry(&entry))
        .await
    {
        Ok(()) => {
            status.mark_register_done(&key);
            let _ = append_to_delivery_log(
                &entry.path_raw.display().to_string(),
                &entry.path_remote,
                "SUCCESS",
                "delivered and registered",
            );
        }
        Err(e) => {
            status.fail(&key, Some(Op::Register), e.to_string());
            let _ = append_to_delivery_log(
                &entry.path_raw.display().to_string(),
                &entry.path_remote,
                "FAIL",
                &e.to_string(),
            );
        }
    }
}

/// Uploads the catalog to the project bucket.
///
/// Session-fatal conditions (missing bucket, dedup round-trip failure)
/// abort before any worker starts; everything after that is file-scoped
/// and lands in the report instead of stopping sibling transfers.
pub async fn deliver_upload(
    api: Arc<ApiClient>,
    store: Arc<ObjectStore>,
    entries: Vec<FileEntry>,
    unresolved: Vec<String>,
    token: &str,
    options: &DeliveryOptions,
) -> Result<DeliveryReport> {
    if !store.bucket_exists().await {
        return Err(DeliveryError::StorageConfig(format!(
            "the project has no bucket '{}'",
            store.bucket()
        )));
    }

    let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
    let existing = api.match_files(token, &keys).await?;
    let (active, already_delivered) = apply_previous_uploads(entries, &existing, options.overwrite);

    let status = Arc::new(StatusTable::new(keys));
    for key in &already_delivered {
        status.fail(key, None, "already delivered");
    }

    debug!(
        active = active.len(),
        already = already_delivered.len(),
        "starting upload workers"
    );

    let progress = progress_bar(active.len() as u64);
    progress.set_message("delivering files...");

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::new();

    for entry in active {
        let permit_source = Arc::clone(&semaphore);
        let api = Arc::clone(&api);
        let store = Arc::clone(&store);
        let status = Arc::clone(&status);
        let token = token.to_string();
        let multipart = options.multipart;
        let progress = progress.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit_source
                .acquire_owned()
                .await
                .expect("semaphore closed");
            process_upload(api, store, status, token, entry, multipart).await;
            progress.inc(1);
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(%e, "upload worker panicked");
        }
    }
    progress.finish_and_clear();

    Ok(build_report(status.snapshot(), &unresolved))
}

enum DownloadOutcome {
    Done(String),
    Skipped(String),
    Failed(String, String),
}

async fn process_download(
    store: Arc<ObjectStore>,
    staging: Arc<StagingDirectory>,
    requested: String,
    results: mpsc::Sender<DownloadOutcome>,
) {
    let matches = match store.key_exists(&requested).await {
        Ok((true, matches)) => matches,
        Ok((false, _)) => {
            let _ = results
                .send(DownloadOutcome::Failed(
                    requested,
                    "not found in storage".into(),
                ))
                .await;
            return;
        }
        Err(e) => {
            let _ = results
                .send(DownloadOutcome::Failed(requested, e.to_string()))
                .await;
            return;
        }
    };

    for key in matches {
        // Folder markers have nothing to materialise.
        if key.ends_with('/') {
            continue;
        }
        let target = staging.files.join(&key);
        let outcome = match store.get_object(&key, &target).await {
            Ok(true) => DownloadOutcome::Done(key),
            Ok(false) => DownloadOutcome::Skipped(key),
            Err(e) => DownloadOutcome::Failed(key, e.to_string()),
        };
        let _ = results.send(outcome).await;
    }
}

/// Downloads the requested keys (or folder prefixes) into the staging
/// tree. Workers report back over a channel; nothing shares mutable
/// state on this path.
pub async fn deliver_download(
    store: Arc<ObjectStore>,
    staging: Arc<StagingDirectory>,
    requested: Vec<String>,
    options: &DeliveryOptions,
) -> Result<DeliveryReport> {
    if !store.bucket_exists().await {
        return Err(DeliveryError::StorageConfig(format!(
            "the project has no bucket '{}'",
            store.bucket()
        )));
    }

    let progress = progress_bar(requested.len() as u64);
    progress.set_message("fetching files...");

    let (tx, mut rx) = mpsc::channel(64);
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::new();

    for path in requested {
        let permit_source = Arc::clone(&semaphore);
        let store = Arc::clone(&store);
        let staging = Arc::clone(&staging);
        let results = tx.clone();
        let progress = progress.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit_source
                .acquire_owned()
                .await
                .expect("semaphore closed");
            process_download(store, staging, path, results).await;
            progress.inc(1);
        }));
    }
    drop(tx);

    let mut report = DeliveryReport::default();
    while let Some(outcome) = rx.recv().await {
        match outcome {
            DownloadOutcome::Done(key) => report.succeeded.push(key),
            DownloadOutcome::Skipped(key) => report.skipped.push(key),
            DownloadOutcome::Failed(key, reason) => report.failed.push((key, reason)),
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(%e, "download worker panicked");
        }
    }
    progress.finish_and_clear();

    report.succeeded.sort();
    report.skipped.sort();
    report.failed.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(key: &str) -> FileEntry {
        FileEntry {
            key: key.into(),
            path_raw: PathBuf::from("/src").join(key),
            subpath: PathBuf::new(),
            size_raw: 10,
            size_processed: 0,
            compressed: false,
            path_processed: PathBuf::from("/stage").join(format!("{key}.zst.ccp")),
            path_remote: format!("ab12cd_{key}.zst.ccp"),
            overwrite: false,
            checksum: String::new(),
        }
    }

    #[test]
    fn known_keys_without_overwrite_leave_the_active_set() {
        let existing = HashMap::from([("a.txt".to_string(), "old_key".to_string())]);
        let (active, already) =
            apply_previous_uploads(vec![entry("a.txt"), entry("b.txt")], &existing, false);

        assert_eq!(already, vec!["a.txt"]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "b.txt");
    }

    #[test]
    fn overwrite_reuses_the_registered_remote_path() {
        let existing = HashMap::from([("a.txt".to_string(), "old_key".to_string())]);
        let (active, already) = apply_previous_uploads(vec![entry("a.txt")], &existing, true);

        assert!(already.is_empty());
        assert!(active[0].overwrite);
        assert_eq!(active[0].path_remote, "old_key");
    }

    #[test]
    fn fresh_keys_keep_their_generated_remote_path() {
        let (active, _) = apply_previous_uploads(vec![entry("a.txt")], &HashMap::new(), true);
        assert!(!active[0].overwrite);
        assert_eq!(active[0].path_remote, "ab12cd_a.txt.zst.ccp");
    }

    #[test]
    fn report_separates_outcomes_and_keeps_failure_reasons() {
        let table = StatusTable::new(["ok.txt", "bad.txt", "dup.txt", "skip.txt"]);

        table.mark_started("ok.txt");
        table.mark_put_started("ok.txt");
        table.mark_put_done("ok.txt");
        table.mark_register_started("ok.txt");
        table.mark_register_done("ok.txt");

        table.mark_started("bad.txt");
        table.fail("bad.txt", Some(Op::Put), "transport error");
        table.fail("dup.txt", None, "already delivered");
        table.skip("skip.txt", "object already in bucket, not uploading");

        let unresolved = vec!["ghost.txt".to_string()];
        let report = build_report(table.snapshot(), &unresolved);

        assert_eq!(report.succeeded, vec!["ok.txt"]);
        assert_eq!(report.skipped, vec!["skip.txt"]);
        assert_eq!(report.failed.len(), 3);
        assert!(report
            .failed
            .contains(&("dup.txt".to_string(), "already delivered".to_string())));
        assert!(report
            .failed
            .contains(&("bad.txt".to_string(), "put: transport error".to_string())));
        assert!(report
            .failed
            .contains(&("ghost.txt".to_string(), "no such file or directory".to_string())));
    }
}
