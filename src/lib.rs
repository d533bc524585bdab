// src/lib.rs

pub mod catalog;
pub mod error;
mod password;
pub mod remote;
pub mod staging;
pub mod status;
pub mod store;
pub mod stream;
pub mod transfer;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;

use crate::remote::ApiClient;
use crate::staging::StagingDirectory;
use crate::store::ObjectStore;
use crate::transfer::{deliver_download, deliver_upload, DeliveryOptions, DeliveryReport};

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    version,
    about = "Deliver files to and from Courier project storage"
)]
pub struct Cli {
    #[arg(
        long,
        default_value = "https://api.courierdelivery.io/v1",
        global = true,
        help = "Base URL for the Courier metadata service"
    )]
    pub api: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and save the session token
    Login {
        username: String,
        #[arg(long)]
        project: Option<String>,
    },

    /// Upload files or folders to the project storage
    Put {
        #[arg(short = 'd', long = "data")]
        data: Vec<String>,
        #[arg(long, help = "File listing one path per line")]
        pathfile: Option<PathBuf>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long, help = "Replace files the project already has")]
        overwrite: bool,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Download files or folders from the project storage
    Get {
        #[arg(short = 'd', long = "data")]
        data: Vec<String>,
        #[arg(long, help = "File listing one remote key per line")]
        pathfile: Option<PathBuf>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long, help = "Where to create the delivery directory")]
        destination: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// List past deliveries recorded in the local log
    Deliveries,
}

#[derive(Serialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SavedCredentials {
    pub token: String,
    #[serde(default)]
    pub project: Option<String>,
}

pub fn get_credentials_file_path() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        home_dir.join(".courier-cli.json")
    } else {
        PathBuf::from(".courier-cli.json")
    }
}

pub fn load_credentials_from_file() -> Result<Option<SavedCredentials>> {
    let path = get_credentials_file_path();
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path)?;
    let creds: SavedCredentials = serde_json::from_str(&data)?;
    Ok(Some(creds))
}

pub fn save_credentials_to_file(token: &str, project: Option<&str>) -> Result<()> {
    let creds = SavedCredentials {
        token: token.to_owned(),
        project: project.map(str::to_owned),
    };
    let path = get_credentials_file_path();
    let data = serde_json::to_string_pretty(&creds)?;
    fs::write(&path, data)?;
    Ok(())
}

pub fn get_final_token_and_project(
    token_opt: Option<String>,
    project_opt: Option<String>,
) -> Result<(String, String)> {
    let saved = load_credentials_from_file()?;

    let token = match token_opt {
        Some(t) => t,
        None => saved.as_ref().map(|c| c.token.clone()).ok_or_else(|| {
            anyhow!(
                "No saved session found. Please run 'login' first \
                 or provide --token."
            )
        })?,
    };

    let project = project_opt
        .or_else(|| saved.and_then(|c| c.project))
        .ok_or_else(|| anyhow!("No project specified. Provide --project or log in with one."))?;

    Ok((token, project))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeliveryLogEntry {
    pub local_path: String,
    pub remote_path: String,
    pub status: String,
    pub message: String,
}

pub fn get_delivery_log_path() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        home_dir.join(".courier-cli-deliveries.json")
    } else {
        PathBuf::from(".courier-cli-deliveries.json")
    }
}

pub fn append_to_delivery_log(
    local_path: &str,
    remote_path: &str,
    status: &str,
    message: &str,
) -> Result<()> {
    let log_path = get_delivery_log_path();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let entry = DeliveryLogEntry {
        local_path: local_path.to_string(),
        remote_path: remote_path.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let json_line = serde_json::to_string(&entry)?;
    writeln!(file, "{}", json_line)?;
    Ok(())
}

/// Format file size in human-readable form
pub fn format_file_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

fn print_report(action: &str, report: &DeliveryReport) {
    println!(
        "{} finished: {} succeeded, {} failed, {} skipped",
        action,
        report.succeeded.len(),
        report.failed.len(),
        report.skipped.len()
    );
    for key in &report.succeeded {
        println!("  delivered: {}", key);
    }
    for key in &report.skipped {
        println!("  skipped:   {}", key);
    }
    for (key, reason) in &report.failed {
        eprintln!("  failed:    {} => {}", key, reason);
    }
}

pub async fn run_cli() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.api.trim_end_matches('/');

    match cli.command {
        Commands::Login { username, project } => {
            let password = password::read_password("Password: ")?;
            let req_body = TokenRequest { username, password };

            let resp = client
                .post(format!("{}/user/token", base_url))
                .json(&req_body)
                .send()
                .await?;

            let status = resp.status();
            let text_body = resp.text().await?;

            if status.is_success() {
                let json = serde_json::from_str::<TokenResponse>(&text_body)?;
                save_credentials_to_file(&json.token, project.as_deref())?;
                println!(
                    "Logged in. Session saved to {}",
                    get_credentials_file_path().display()
                );
            } else {
                return Err(anyhow!(
                    "Login failed. Status = {}, Body = {}",
                    status,
                    text_body
                ));
            }
        }

        Commands::Put {
            data,
            pathfile,
            project,
            token,
            overwrite,
            concurrency,
        } => {
            let (token, project) = get_final_token_and_project(token, project)?;

            let paths = catalog::collect_upload_paths(&data, pathfile.as_deref())?;
            let staging =
                StagingDirectory::create(&std::env::current_dir()?, &staging::session_label())?;
            let entries = match catalog::build_entries(&paths.resolved, &staging.files) {
                Ok(entries) => entries,
                Err(e) => {
                    let _ = staging.destroy();
                    return Err(e.into());
                }
            };

            let total_raw: u64 = entries.iter().map(|e| e.size_raw).sum();
            println!(
                "Delivering {} files ({}) to project {}",
                entries.len(),
                format_file_size(total_raw),
                project
            );

            let api = Arc::new(ApiClient::new(client.clone(), base_url));
            let store = Arc::new(ObjectStore::connect(&project).await);
            let options = DeliveryOptions {
                overwrite,
                concurrency,
                ..Default::default()
            };

            let result =
                deliver_upload(api, store, entries, paths.unresolved, &token, &options).await;

            if let Err(e) = staging.destroy() {
                eprintln!(
                    "Could not remove staging directory {}: {}",
                    staging.root.display(),
                    e
                );
            }

            let report = result?;
            print_report("Upload", &report);
            println!(
                "Check the log file for details:\n  {}",
                get_delivery_log_path().display()
            );
        }

        Commands::Get {
            data,
            pathfile,
            project,
            token,
            destination,
            concurrency,
        } => {
            let (_token, project) = get_final_token_and_project(token, project)?;

            let keys = catalog::collect_download_keys(&data, pathfile.as_deref())?;
            let root = match destination {
                Some(d) => d,
                None => std::env::current_dir()?,
            };
            let staging = Arc::new(StagingDirectory::create(&root, &staging::session_label())?);
            let store = Arc::new(ObjectStore::connect(&project).await);
            let options = DeliveryOptions {
                concurrency,
                ..Default::default()
            };

            let report = deliver_download(store, Arc::clone(&staging), keys, &options).await?;
            print_report("Download", &report);
            println!("Files delivered to {}", staging.files.display());
        }

        Commands::Deliveries => {
            let log_path = get_delivery_log_path();
            if !log_path.exists() {
                println!("No delivery log found at {}", log_path.display());
            } else {
                let contents = fs::read_to_string(&log_path)?;
                for (i, line) in contents.lines().enumerate() {
                    if let Ok(entry) = serde_json::from_str::<DeliveryLogEntry>(line) {
                        println!(
                            "{}: local='{}', remote='{}', status='{}', msg='{}'",
                            i + 1,
                            entry.local_path,
                            entry.remote_path,
                            entry.status,
                            entry.message
                        );
                    } else {
                        println!("{}: (unparseable JSON) => {}", i + 1, line);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sizes_format_with_the_right_unit() {
        assert_eq!(format_file_size(0), "0.00 B");
        assert_eq!(format_file_size(1023), "1023.00 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn credentials_round_trip_through_json() {
        let creds = SavedCredentials {
            token: "abc".into(),
            project: Some("proj-1".into()),
        };
        let json = serde_json::to_string(&creds).unwrap();
        let back: SavedCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token, "abc");
        assert_eq!(back.project.as_deref(), Some("proj-1"));

        // Older credential files without a project still parse.
        let back: SavedCredentials = serde_json::from_str(r#"{"token":"t"}"#).unwrap();
        assert!(back.project.is_none());
    }
}
