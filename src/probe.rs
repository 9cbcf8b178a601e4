use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use reqwest::{Certificate, Client, Identity, StatusCode};
use tracing::debug;

use crate::error::{HarnessError, Result};

const CA_CERT_FILE: &str = "ca.pem";
const CLIENT_CERT_FILE: &str = "cert.pem";
const CLIENT_KEY_FILE: &str = "key.pem";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest TLS protocol version a probe client will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().trim_start_matches("tls") {
            "1.2" | "12" => Ok(Self::Tls12),
            "1.3" | "13" => Ok(Self::Tls13),
            other => anyhow::bail!("unsupported TLS version '{other}' (expected 1.2 or 1.3)"),
        }
    }
}

impl From<TlsVersion> for reqwest::tls::Version {
    fn from(value: TlsVersion) -> Self {
        match value {
            TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

/// Trust root plus client certificate and key, all PEM encoded.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Reads `ca.pem`, `cert.pem` and `key.pem` from a directory.
    ///
    /// # Errors
    /// Returns [`HarnessError::Tls`] if any file cannot be read.
    pub async fn from_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            ca_cert: read_pem(dir.join(CA_CERT_FILE)).await?,
            client_cert: read_pem(dir.join(CLIENT_CERT_FILE)).await?,
            client_key: read_pem(dir.join(CLIENT_KEY_FILE)).await?,
        })
    }
}

async fn read_pem(path: PathBuf) -> Result<Vec<u8>> {
    tokio::fs::read(&path)
        .await
        .map_err(|e| HarnessError::Tls(format!("failed to read {}: {e}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub body: String,
}

/// HTTP client used to exercise endpoints served by a running container.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    client: Client,
}

impl ProbeClient {
    /// Builds a plain client using the platform trust store.
    ///
    /// # Errors
    /// Returns [`HarnessError::Tls`] if the HTTP client cannot be built.
    pub fn plain() -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Tls(format!("failed to build probe client: {e}")))?;
        Ok(Self { client })
    }

    /// Builds a client that trusts only `material.ca_cert` and presents the
    /// client certificate and key.
    ///
    /// # Errors
    /// Returns [`HarnessError::Tls`] if the material cannot be parsed.
    pub fn mutual_tls(material: &TlsMaterial, min_version: TlsVersion) -> Result<Self> {
        let ca = Certificate::from_pem(&material.ca_cert)
            .map_err(|e| HarnessError::Tls(format!("invalid CA certificate: {e}")))?;

        let mut identity_pem = material.client_key.clone();
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&material.client_cert);
        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| HarnessError::Tls(format!("invalid client certificate or key: {e}")))?;

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .min_tls_version(min_version.into())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Tls(format!("failed to build probe client: {e}")))?;
        Ok(Self { client })
    }

    /// Issues a GET request and reads the whole body.
    ///
    /// # Errors
    /// Returns the transport error (e.g. connection refused, handshake failure).
    pub async fn get(&self, url: &str) -> Result<ProbeResponse, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("GET {url} -> {status}");
        Ok(ProbeResponse { status, body })
    }
}
