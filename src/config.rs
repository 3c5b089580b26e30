//! Configuration for hostgate
//!
//! Two layers:
//! - [`Args`]: process arguments and environment variables (clap)
//! - [`SettingsStore`]: the persisted JSON settings blob shared with the rest
//!   of the host tooling (hostnames, ports, certificate material)

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::tls::CertificatePair;
use crate::types::{GatewayError, Result};

/// hostgate - authenticated front door for cluster hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "hostgate")]
#[command(about = "Cluster-join reverse proxy with ACME, mutual TLS and OAuth2 delegation")]
pub struct Args {
    /// Path of the persisted JSON settings file
    #[arg(long, env = "SETTINGS_PATH", default_value = "hostgate.json")]
    pub settings: PathBuf,

    /// Address the front door and the HTTP forwarder bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Base URL of the central authority (OAuth2 provider and host registry)
    #[arg(long, env = "AUTHORITY_URL", default_value = "https://janitor.local")]
    pub authority_url: String,

    /// OAuth2 client id this host uses with the central authority
    #[arg(long, env = "OAUTH2_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// OAuth2 client secret this host uses with the central authority
    #[arg(long, env = "OAUTH2_CLIENT_SECRET", default_value = "")]
    pub client_secret: String,

    /// OAuth2 scope requested for interactive delegation
    #[arg(long, env = "OAUTH2_SCOPE", default_value = "user:ports")]
    pub scope: String,

    /// ACME directory URL (Let's Encrypt compatible)
    #[arg(
        long,
        env = "ACME_DIRECTORY_URL",
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    pub acme_directory_url: String,

    /// Directory receiving the Docker engine's server TLS files
    #[arg(long, env = "DOCKER_TLS_DIR", default_value = "/etc/docker/tls")]
    pub docker_tls_dir: PathBuf,

    /// Port the Docker engine serves mutual TLS on
    #[arg(long, env = "DOCKER_TLS_PORT", default_value = "2376")]
    pub docker_tls_port: u16,

    /// Name of the session cookie on the front door
    #[arg(long, env = "SESSION_COOKIE", default_value = "hostgate.sid")]
    pub session_cookie: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.client_id.is_empty() {
            return Err("OAUTH2_CLIENT_ID is required".to_string());
        }
        if self.client_secret.is_empty() {
            return Err("OAUTH2_CLIENT_SECRET is required".to_string());
        }
        if !(self.authority_url.starts_with("https://") || self.authority_url.starts_with("http://"))
        {
            return Err(format!(
                "AUTHORITY_URL must be an http(s) URL, got '{}'",
                self.authority_url
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Persisted settings
// ============================================================================

/// Persisted host settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Public hostnames of this host; the first one is canonical
    pub hostnames: Vec<String>,
    pub ports: Ports,
    pub security: Security,
    pub https: HttpsMaterial,
    pub tls: TlsMaterial,
    pub letsencrypt: LetsEncrypt,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Ports {
    pub http: u16,
    pub https: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            http: 80,
            https: 443,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Security {
    /// Serve the front door over plain HTTP (no certificates at all)
    pub force_http: bool,
    /// Use a self-signed HTTPS certificate instead of ACME
    pub force_insecure: bool,
}

/// Public HTTPS certificate material
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpsMaterial {
    pub key: Option<String>,
    pub crt: Option<String>,
    /// Intermediate chain presented after `crt`
    pub ca: Vec<String>,
}

/// Cluster mutual-TLS hierarchy (the server leaf lives on disk only)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsMaterial {
    pub ca: Option<CertificatePair>,
    pub client: Option<CertificatePair>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LetsEncrypt {
    /// Contact address registered with the ACME account
    pub email: Option<String>,
    /// Serialized ACME account credentials; present once registered
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    /// Port -> path prefixes that make an ambiguous request likely for that port
    pub heuristics: BTreeMap<u16, Vec<String>>,
}

impl Settings {
    /// Whether the front door runs without TLS
    pub fn insecure_transport(&self) -> bool {
        self.security.force_http
    }

    /// Canonical public hostname
    pub fn primary_hostname(&self) -> Option<&str> {
        self.hostnames.first().map(String::as_str)
    }
}

/// Key-value settings store backed by a JSON file
///
/// Readers get a snapshot clone; writers replace the snapshot and call
/// [`SettingsStore::save`] to make it durable. Saves are serialized and
/// replace the file atomically, so a failed save leaves the file at its
/// previous contents.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    save_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file is absent
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Settings file not found, using defaults");
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::new(path, settings))
    }

    /// Create a store around an in-memory value
    pub fn new(path: PathBuf, settings: Settings) -> Self {
        Self {
            path,
            current: RwLock::new(settings),
            save_lock: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply a change to the in-memory snapshot
    pub fn update(&self, change: impl FnOnce(&mut Settings)) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        change(&mut current);
    }

    /// Write the current snapshot to disk and flush it
    ///
    /// The snapshot is taken once the previous save finished, then written to
    /// a sibling temp file that is renamed over the target.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let json = serde_json::to_vec_pretty(&self.get())?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), bytes = json.len(), "Settings saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "settings".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Limit a file to owner read/write
pub async fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| {
                GatewayError::Config(format!("chmod 600 {} failed: {}", path.display(), e))
            })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
