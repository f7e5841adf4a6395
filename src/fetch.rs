//! Binary acquisition
//!
//! The supervisors only need "give me the bytes of this executable for the
//! current platform"; [`BinaryFetcher`] is that contract and [`ReleaseFetcher`]
//! the HTTP implementation used in production.

use hyper::body::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const ENGINE_DOWNLOAD_URL: &str = "https://tt.vg/DrLSV";
const TUNNEL_RELEASE_URL: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download/";

/// Errors raised while acquiring a binary
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{artifact}: unsupported platform {os}/{arch}")]
    Unsupported {
        artifact: Artifact,
        os: String,
        arch: String,
    },
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to write binary: {0}")]
    Io(#[from] std::io::Error),
}

/// The executables this crate knows how to acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Engine,
    Tunnel,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Engine => write!(f, "engine"),
            Artifact::Tunnel => write!(f, "tunnel"),
        }
    }
}

impl Artifact {
    /// Download location for this artifact on `os`/`arch` (as in `std::env::consts`)
    pub fn download_url(&self, os: &str, arch: &str) -> Result<String, FetchError> {
        let url = match (self, os, arch) {
            (Artifact::Engine, "linux", "x86_64") => Some(ENGINE_DOWNLOAD_URL.to_string()),
            (Artifact::Tunnel, "linux", "x86_64") => {
                Some(format!("{}cloudflared-linux-amd64", TUNNEL_RELEASE_URL))
            }
            (Artifact::Tunnel, "linux", "aarch64") => {
                Some(format!("{}cloudflared-linux-arm64", TUNNEL_RELEASE_URL))
            }
            (Artifact::Tunnel, "windows", "x86_64") => {
                Some(format!("{}cloudflared-windows-amd64.exe", TUNNEL_RELEASE_URL))
            }
            _ => None,
        };

        url.ok_or_else(|| FetchError::Unsupported {
            artifact: *self,
            os: os.to_string(),
            arch: arch.to_string(),
        })
    }
}

/// Source of executable bytes for a platform/architecture pair
pub trait BinaryFetcher: Send + Sync {
    fn fetch(&self, os: &str, arch: &str) -> impl Future<Output = Result<Bytes, FetchError>> + Send;
}

/// Downloads release binaries over HTTPS, following redirects
#[derive(Clone)]
pub struct ReleaseFetcher {
    artifact: Artifact,
    client: reqwest::Client,
}

impl ReleaseFetcher {
    pub fn new(artifact: Artifact) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { artifact, client })
    }

    pub fn artifact(&self) -> Artifact {
        self.artifact
    }
}

impl BinaryFetcher for ReleaseFetcher {
    fn fetch(&self, os: &str, arch: &str) -> impl Future<Output = Result<Bytes, FetchError>> + Send {
        let url = self.artifact.download_url(os, arch);
        let client = self.client.clone();
        let artifact = self.artifact;
        async move {
            let url = url?;
            info!(%artifact, %url, "Downloading binary");
            let bytes = client
                .get(&url)
                .header(reqwest::header::CACHE_CONTROL, "no-store")
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            debug!(%artifact, size = bytes.len(), "Download complete");
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_only_on_linux_x86_64() {
        assert_eq!(
            Artifact::Engine.download_url("linux", "x86_64").unwrap(),
            ENGINE_DOWNLOAD_URL
        );
        assert!(matches!(
            Artifact::Engine.download_url("linux", "aarch64"),
            Err(FetchError::Unsupported { .. })
        ));
        assert!(Artifact::Engine.download_url("windows", "x86_64").is_err());
    }

    #[test]
    fn test_tunnel_release_assets() {
        assert!(Artifact::Tunnel
            .download_url("linux", "aarch64")
            .unwrap()
            .ends_with("/cloudflared-linux-arm64"));
        assert!(Artifact::Tunnel
            .download_url("windows", "x86_64")
            .unwrap()
            .ends_with("/cloudflared-windows-amd64.exe"));
        assert!(Artifact::Tunnel.download_url("macos", "aarch64").is_err());
    }

    #[test]
    fn test_unsupported_message() {
        let err = Artifact::Tunnel.download_url("freebsd", "x86_64").unwrap_err();
        assert_eq!(err.to_string(), "tunnel: unsupported platform freebsd/x86_64");
    }

    #[tokio::test]
    async fn test_release_fetcher_rejects_unsupported_before_network() {
        let fetcher = ReleaseFetcher::new(Artifact::Engine).unwrap();
        assert_eq!(fetcher.artifact(), Artifact::Engine);
        let result = fetcher.fetch("plan9", "mips").await;
        assert!(matches!(result, Err(FetchError::Unsupported { .. })));
    }
}
