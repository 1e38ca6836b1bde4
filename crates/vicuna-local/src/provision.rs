//! Download of the inference executable and model weights.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Result, VicunaError};
use crate::model::ModelId;

const WINDOWS_EXECUTABLE_URL: &str =
    "https://github.com/shubham8550/vicuna-ts/blob/master/assets/main.exe?raw=true";

/// Operating system a download is selected for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Other(String),
}

impl Platform {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => f.write_str("windows"),
            Platform::Linux => f.write_str("linux"),
            Platform::MacOs => f.write_str("macos"),
            Platform::Other(name) => f.write_str(name),
        }
    }
}

/// A file a session needs on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Asset {
    Executable,
    Model(ModelId),
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Executable => f.write_str("inference executable"),
            Asset::Model(id) => write!(f, "model {}", id),
        }
    }
}

/// Download URLs keyed by platform (executables) and model id (weights).
#[derive(Debug, Clone)]
pub struct SourceTable {
    executables: HashMap<Platform, String>,
    models: HashMap<ModelId, String>,
}

impl SourceTable {
    /// A table with no sources at all.
    pub fn empty() -> Self {
        Self {
            executables: HashMap::new(),
            models: HashMap::new(),
        }
    }

    pub fn with_executable(mut self, platform: Platform, url: impl Into<String>) -> Self {
        self.executables.insert(platform, url.into());
        self
    }

    pub fn with_model(mut self, model: ModelId, url: impl Into<String>) -> Self {
        self.models.insert(model, url.into());
        self
    }

    /// Find the URL for `asset` on `platform`.
    pub fn resolve(&self, asset: &Asset, platform: &Platform) -> Result<&str> {
        match asset {
            Asset::Executable => self
                .executables
                .get(platform)
                .map(String::as_str)
                .ok_or_else(|| VicunaError::PlatformUnsupported {
                    platform: platform.to_string(),
                    asset: asset.to_string(),
                }),
            Asset::Model(model) => self
                .models
                .get(model)
                .map(String::as_str)
                .ok_or_else(|| VicunaError::NoSource {
                    asset: asset.to_string(),
                }),
        }
    }
}

impl Default for SourceTable {
    fn default() -> Self {
        let mut table = Self::empty().with_executable(Platform::Windows, WINDOWS_EXECUTABLE_URL);
        for model in ModelId::supported() {
            let url = format!(
                "https://huggingface.co/eachadea/{}/resolve/main/{}.bin",
                model.as_str().trim_end_matches("-rev1"),
                model.as_str()
            );
            table = table.with_model(model, url);
        }
        table
    }
}

/// Puts an asset at a destination path.
#[async_trait]
pub trait Provision: Send + Sync {
    async fn ensure(&self, asset: &Asset, destination: &Path) -> Result<()>;
}

/// Byte-level progress of one download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub asset: Asset,
    pub downloaded: u64,
    pub total: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Downloads assets over HTTP.
pub struct HttpProvisioner {
    client: reqwest::Client,
    sources: SourceTable,
    platform: Platform,
    show_progress: bool,
    on_progress: Option<ProgressCallback>,
}

impl HttpProvisioner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            sources: SourceTable::default(),
            platform: Platform::current(),
            show_progress: true,
            on_progress: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_sources(mut self, sources: SourceTable) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Draw a terminal progress bar while downloading.
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&DownloadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    fn progress_bar(&self, total: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        match total {
            Some(size) => {
                let pb = ProgressBar::new(size);
                let style = ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-");
                pb.set_style(style);
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                let style = ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {bytes} downloaded")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                pb.set_style(style);
                pb
            }
        }
    }

    async fn download(&self, asset: &Asset, url: &str, mut file: File) -> Result<u64> {
        let failed = |reason: String| VicunaError::Download {
            asset: asset.to_string(),
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let total = response.content_length();
        let pb = self.progress_bar(total);

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);

            if let Some(callback) = &self.on_progress {
                callback(&DownloadProgress {
                    asset: asset.clone(),
                    downloaded,
                    total,
                });
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        pb.finish_with_message("Download complete");
        Ok(downloaded)
    }
}

impl Default for HttpProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provision for HttpProvisioner {
    async fn ensure(&self, asset: &Asset, destination: &Path) -> Result<()> {
        let url = self.sources.resolve(asset, &self.platform)?;

        let dir = match destination.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).await?;

        info!("Downloading {} to {:?}", asset, destination);

        // Staged next to the destination and renamed into place once complete.
        // The temp file is deleted on drop.
        let partial = tempfile::Builder::new()
            .prefix(".vicuna-")
            .suffix(".part")
            .tempfile_in(dir)?;
        let file = File::from_std(partial.as_file().try_clone()?);

        let bytes = self.download(asset, url, file).await?;
        debug!("Wrote {} bytes to {:?}", bytes, partial.path());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if *asset == Asset::Executable { 0o755 } else { 0o644 };
            fs::set_permissions(partial.path(), std::fs::Permissions::from_mode(mode)).await?;
        }

        partial
            .persist(destination)
            .map_err(|e| VicunaError::Io(e.error))?;

        info!("File downloaded successfully to {:?}", destination);
        Ok(())
    }
}

/// Fetch whatever the session is missing, or everything when `force` is set.
///
/// Returns the assets that were downloaded.
pub async fn provision_missing(
    provisioner: &dyn Provision,
    config: &SessionConfig,
    force: bool,
) -> Result<Vec<Asset>> {
    let force = force || config.force_download();

    let mut needed = Vec::new();
    if force || !config.executable_path().exists() {
        needed.push((Asset::Executable, config.executable_path()));
    }
    if force || !config.model_path().exists() {
        needed.push((Asset::Model(config.model().clone()), config.model_path()));
    }

    if needed.is_empty() {
        debug!("All assets present, nothing to download");
        return Ok(Vec::new());
    }

    let downloads = needed
        .iter()
        .map(|(asset, path)| provisioner.ensure(asset, path));
    futures_util::future::try_join_all(downloads).await?;

    Ok(needed.into_iter().map(|(asset, _)| asset).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOverrides;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_default_sources() {
        let table = SourceTable::default();
        assert_eq!(
            table.resolve(&Asset::Executable, &Platform::Windows).unwrap(),
            WINDOWS_EXECUTABLE_URL
        );
        assert_eq!(
            table
                .resolve(&Asset::Model(ModelId::Vicuna13B), &Platform::Linux)
                .unwrap(),
            "https://huggingface.co/eachadea/ggml-vicuna-13b-4bit/resolve/main/ggml-vicuna-13b-4bit-rev1.bin"
        );
    }

    #[test]
    fn test_executable_unsupported_platform() {
        let table = SourceTable::default();
        for platform in [Platform::Linux, Platform::MacOs, Platform::Other("freebsd".into())] {
            let err = table.resolve(&Asset::Executable, &platform).unwrap_err();
            match err {
                VicunaError::PlatformUnsupported { platform: name, .. } => {
                    assert_eq!(name, platform.to_string())
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_platform_added_to_table() {
        let table = SourceTable::default().with_executable(Platform::Linux, "https://example.com/main");
        assert_eq!(
            table.resolve(&Asset::Executable, &Platform::Linux).unwrap(),
            "https://example.com/main"
        );
    }

    #[test]
    fn test_custom_model_has_no_source() {
        let asset = Asset::Model(ModelId::Custom("mine".into()));
        let err = SourceTable::default()
            .resolve(&asset, &Platform::Windows)
            .unwrap_err();
        assert!(matches!(err, VicunaError::NoSource { .. }));
    }

    /// Serve a single HTTP response on an ephemeral port.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        serve_after(Duration::ZERO, status, body).await
    }

    async fn serve_after(delay: Duration, status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            tokio::time::sleep(delay).await;
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            let _ = socket.shutdown().await;
        });

        format!("http://{}/asset.bin", addr)
    }

    /// Announce `declared` bytes, send `prefix`, then hang.
    async fn serve_stalled(prefix: &'static [u8], declared: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", declared);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(prefix).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        format!("http://{}/main", addr)
    }

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_http_download_creates_dirs() {
        let url = serve_once("200 OK", b"model bytes").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("weights.bin");

        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let provisioner = HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_sources(SourceTable::empty().with_model(ModelId::Vicuna7B, url))
            .on_progress(move |p| sink.lock().unwrap().push((p.downloaded, p.total)));

        provisioner
            .ensure(&Asset::Model(ModelId::Vicuna7B), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"model bytes");
        let progress = progress.lock().unwrap();
        assert_eq!(progress.last(), Some(&(11, Some(11))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_http_download_executable_mode() {
        use std::os::unix::fs::PermissionsExt;

        let url = serve_once("200 OK", b"#!/bin/sh\n").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("main");

        HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_platform(Platform::Linux)
            .with_sources(SourceTable::empty().with_executable(Platform::Linux, url))
            .ensure(&Asset::Executable, &dest)
            .await
            .unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let url = serve_once("404 Not Found", b"").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("weights.bin");

        let err = HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_sources(SourceTable::empty().with_model(ModelId::Vicuna7B, url.clone()))
            .ensure(&Asset::Model(ModelId::Vicuna7B), &dest)
            .await
            .unwrap_err();

        match err {
            VicunaError::Download { url: failed, reason, .. } => {
                assert_eq!(failed, url);
                assert!(reason.contains("404"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_existing_file() {
        let url = serve_once("404 Not Found", b"").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("weights.bin");
        std::fs::write(&dest, b"GOOD WEIGHTS").unwrap();

        let err = HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_sources(SourceTable::empty().with_model(ModelId::Vicuna7B, url))
            .ensure(&Asset::Model(ModelId::Vicuna7B), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, VicunaError::Download { .. }), "{err}");
        assert_eq!(std::fs::read(&dest).unwrap(), b"GOOD WEIGHTS");
        assert_eq!(entries(dir.path()), ["weights.bin"]);
    }

    #[tokio::test]
    async fn test_download_replaces_existing_file() {
        let url = serve_once("200 OK", b"new weights").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("weights.bin");
        std::fs::write(&dest, b"old weights").unwrap();

        HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_sources(SourceTable::empty().with_model(ModelId::Vicuna7B, url))
            .ensure(&Asset::Model(ModelId::Vicuna7B), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new weights");
        assert_eq!(entries(dir.path()), ["weights.bin"]);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_nothing_installed() {
        let exe_url = serve_stalled(b"0123456789", 1000).await;
        let model_url = serve_after(Duration::from_millis(300), "404 Not Found", b"").await;
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::resolve(SessionOverrides::new().data_dir(dir.path())).unwrap();

        let provisioner = HttpProvisioner::new()
            .with_client(local_client())
            .with_progress_bar(false)
            .with_platform(Platform::Linux)
            .with_sources(
                SourceTable::empty()
                    .with_executable(Platform::Linux, exe_url)
                    .with_model(ModelId::Vicuna7B, model_url),
            );

        let err = provision_missing(&provisioner, &config, false)
            .await
            .unwrap_err();
        assert!(matches!(err, VicunaError::Download { .. }), "{err}");
        assert!(!config.executable_path().exists());
        assert!(!config.model_path().exists());
        assert!(entries(dir.path()).is_empty(), "{:?}", entries(dir.path()));

        // Both assets are still missing, so a retry fetches both.
        let recorder = Recorder::default();
        let fetched = provision_missing(&recorder, &config, false).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_platform_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bin").join("main");

        let err = HttpProvisioner::new()
            .with_platform(Platform::Other("plan9".into()))
            .ensure(&Asset::Executable, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, VicunaError::PlatformUnsupported { .. }));
        assert!(!dest.parent().unwrap().exists());
    }

    /// Records requests and writes placeholder files.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Asset>>,
    }

    #[async_trait]
    impl Provision for Recorder {
        async fn ensure(&self, asset: &Asset, destination: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(asset.clone());
            std::fs::write(destination, b"stub")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_provision_missing_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::resolve(SessionOverrides::new().data_dir(dir.path())).unwrap();
        std::fs::write(config.executable_path(), b"exe").unwrap();

        let recorder = Recorder::default();
        let fetched = provision_missing(&recorder, &config, false).await.unwrap();
        assert_eq!(fetched, [Asset::Model(ModelId::Vicuna7B)]);

        // Everything is present now.
        let fetched = provision_missing(&recorder, &config, false).await.unwrap();
        assert!(fetched.is_empty());
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provision_forced() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::resolve(
            SessionOverrides::new()
                .data_dir(dir.path())
                .force_download(true),
        )
        .unwrap();
        std::fs::write(config.executable_path(), b"exe").unwrap();
        std::fs::write(config.model_path(), b"weights").unwrap();

        let recorder = Recorder::default();
        let fetched = provision_missing(&recorder, &config, false).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(std::fs::read(config.model_path()).unwrap(), b"stub");
    }
}
