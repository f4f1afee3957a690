//! Download orchestration for Spotify tracks.
//!
//! A Spotify track reaches disk through one of two paths:
//!
//! 1. **Bulk download**: the primary API resolves the track (or a whole
//!    playlist) and serves either a single MP3 or a ZIP archive of MP3s.
//! 2. **Legacy scheme**: the CDN serves an AES-CTR encrypted OGG stream
//!    whose headers are damaged. It is decrypted, repaired and repacked:
//!
//! ```text
//! <tc>.encrypted.ogg ──decrypt──> <tc>.decrypted.ogg ──repair──┐
//!                                                              │
//!                                   <tc>.ogg <──────repack─────┘
//! ```
//!
//! The legacy scheme is only tried when the bulk download fails. Every
//! artifact is named after the track's cache-key token, so an existing
//! final artifact short-circuits all work.
//!
//! # Concurrency
//!
//! Downloads of different tokens are independent. Two concurrent
//! downloads of the *same* token share intermediate files and must be
//! serialized by the caller.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use url::Url;

use crate::{
    config::Config,
    decrypt::{Decrypt, Key},
    error::{Error, Result},
    http::{self, Fetch},
    ogg,
    track::Track,
    transcode::Transcoder,
};

/// Files produced by a successful download.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Downloaded {
    /// A single playable file.
    File(PathBuf),

    /// The MP3 files extracted from a bulk archive, in archive order.
    Files(Vec<PathBuf>),
}

impl Downloaded {
    /// Returns all downloaded paths.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            Self::File(path) => std::slice::from_ref(path),
            Self::Files(paths) => paths,
        }
    }

    #[must_use]
    pub fn into_paths(self) -> Vec<PathBuf> {
        match self {
            Self::File(path) => vec![path],
            Self::Files(paths) => paths,
        }
    }
}

impl fmt::Display for Downloaded {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Files(paths) => write!(f, "{} files", paths.len()),
        }
    }
}

/// Downloads a single Spotify track.
pub struct SpotifyDownload<F> {
    client: Arc<F>,
    transcoder: Transcoder,
    primary_api_url: Url,
    downloads_dir: PathBuf,
    track: Track,
    token: String,

    encrypted: PathBuf,
    decrypted: PathBuf,
    output: PathBuf,
    mp3: PathBuf,
}

impl<F> SpotifyDownload<F>
where
    F: Fetch,
{
    /// Path of the bulk download endpoint, relative to the primary API.
    const BULK_ENDPOINT: &'static str = "download/";

    const SPOTIFY_TRACK_URL: &'static str = "https://open.spotify.com/track/";

    /// Prepares the download of `track` into the configured downloads
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the track has no cache-key token.
    pub fn new(client: Arc<F>, config: &Config, track: Track) -> Result<Self> {
        let token = track.cache_token()?;
        let downloads_dir = config.downloads_dir.clone();

        Ok(Self {
            client,
            transcoder: Transcoder::from_config(config),
            primary_api_url: config.primary_api_url.clone(),
            encrypted: downloads_dir.join(format!("{token}.encrypted.ogg")),
            decrypted: downloads_dir.join(format!("{token}.decrypted.ogg")),
            output: downloads_dir.join(format!("{token}.ogg")),
            mp3: downloads_dir.join(format!("{token}.mp3")),
            downloads_dir,
            track,
            token,
        })
    }

    /// Produces playable files for the track.
    ///
    /// An existing final artifact is returned without any network access.
    /// Otherwise the bulk download is tried first and the legacy scheme
    /// second.
    ///
    /// # Errors
    ///
    /// Returns the legacy scheme's error when both paths fail; bulk
    /// download errors are only logged.
    pub async fn process(&self) -> Result<Downloaded> {
        if let Some(existing) = self.existing().await {
            info!("found existing file {}", existing.display());
            return Ok(Downloaded::File(existing));
        }

        match self.download_bulk().await {
            Ok(downloaded) => {
                info!("downloaded {} through the bulk api: {downloaded}", self.track);
                return Ok(downloaded);
            }
            Err(e) => warn!("bulk download of {} failed: {e}", self.track),
        }

        self.process_original().await.map(Downloaded::File)
    }

    /// Runs the legacy scheme: download, decrypt, repair and repack.
    ///
    /// Intermediate files are removed whatever the outcome. On failure a
    /// partially written final artifact is removed as well.
    ///
    /// # Errors
    ///
    /// * `FailedPrecondition` if the track has no CDN URL or key
    /// * `OutOfRange` or `InvalidArgument` if the key is malformed
    /// * any error of the download, decryption or repack step
    pub async fn process_original(&self) -> Result<PathBuf> {
        if tokio::fs::try_exists(&self.output).await.unwrap_or(false) {
            info!("found existing file {}", self.output.display());
            return Ok(self.output.clone());
        }

        let (Some(cdnurl), Some(key)) = (&self.track.cdnurl, &self.track.key) else {
            warn!("missing cdn url or key for {}", self.track);
            return Err(Error::failed_precondition(format!(
                "{} has no cdn url or key",
                self.token
            )));
        };
        let key: Key = key.parse()?;

        let result = self.run_original(cdnurl.clone(), &key).await;
        self.cleanup().await;

        match result {
            Ok(()) => {
                info!("processed {} into {}", self.track, self.output.display());
                Ok(self.output.clone())
            }
            Err(e) => {
                error!("error processing {}: {e}", self.track);
                remove_if_exists(&self.output).await;
                Err(e)
            }
        }
    }

    async fn run_original(&self, cdnurl: Url, key: &Key) -> Result<()> {
        self.client
            .download(cdnurl, Some(self.encrypted.clone()))
            .await?;
        Decrypt::decrypt_file(key, &self.encrypted, &self.decrypted).await?;
        ogg::repair_file(&self.decrypted).await;
        self.transcoder.repack(&self.decrypted, &self.output).await?;

        if !tokio::fs::try_exists(&self.output).await? {
            return Err(Error::internal(format!(
                "repack did not produce {}",
                self.output.display()
            )));
        }

        Ok(())
    }

    /// Downloads the track through the bulk API.
    async fn download_bulk(&self) -> Result<Downloaded> {
        let source = self.source_url()?;
        let mut url = http::endpoint(&self.primary_api_url, Self::BULK_ENDPOINT)?;
        url.query_pairs_mut().append_pair("url", &source);

        let destination = self.downloads_dir.join(&self.token);
        let path = self.client.download(url, Some(destination)).await?;

        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("mp3") => Ok(Downloaded::File(path)),
            Some("zip") => {
                let files = extract_mp3s(path.clone(), self.downloads_dir.clone()).await;
                remove_if_exists(&path).await;
                let files = files?;
                if files.is_empty() {
                    return Err(Error::not_found(format!(
                        "{} contains no mp3 files",
                        path.display()
                    )));
                }
                info!("extracted {} mp3 files from {}", files.len(), path.display());
                Ok(Downloaded::Files(files))
            }
            _ => {
                remove_if_exists(&path).await;
                Err(Error::unimplemented(format!(
                    "unsupported bulk download {}",
                    path.display()
                )))
            }
        }
    }

    /// The URL the bulk API resolves: the playlist itself, or the
    /// canonical track URL.
    fn source_url(&self) -> Result<String> {
        if self.track.is_playlist() {
            return Ok(self.track.url.clone());
        }

        let id = self
            .track
            .spotify_id()
            .ok_or_else(|| Error::invalid_argument(format!("{} has no spotify id", self.token)))?;

        Ok(format!("{}{id}", Self::SPOTIFY_TRACK_URL))
    }

    async fn existing(&self) -> Option<PathBuf> {
        for path in [&self.output, &self.mp3] {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Some(path.clone());
            }
        }
        None
    }

    async fn cleanup(&self) {
        for path in [&self.encrypted, &self.decrypted] {
            remove_if_exists(path).await;
        }
    }
}

/// Removes a file, logging anything but its absence.
async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => trace!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("error removing {}: {e}", path.display()),
    }
}

/// Extracts every `.mp3` entry of an archive below `directory`.
async fn extract_mp3s(archive: PathBuf, directory: PathBuf) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || extract_mp3s_blocking(&archive, &directory)).await?
}

fn extract_mp3s_blocking(archive: &Path, directory: &Path) -> Result<Vec<PathBuf>> {
    let file = std::fs::File::open(archive)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".mp3") {
            continue;
        }

        // Entries escaping the target directory are skipped.
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping unsafe archive entry {}", entry.name());
            continue;
        };

        let path = directory.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&path)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted.push(path);
    }

    Ok(extracted)
}
