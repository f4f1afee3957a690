//! Runtime configuration.
//!
//! Configuration is read once at startup, typically from a TOML file, and
//! handed to [`http::Client`](crate::http::Client),
//! [`ApiData`](crate::api::ApiData) and
//! [`SpotifyDownload`](crate::spotify::SpotifyDownload) explicitly.
//!
//! # File format
//!
//! ```toml
//! downloads_dir = "downloads"
//! api_url = "https://api.example.com"
//! api_key = "secret"
//! primary_api_url = "https://spotify-dl-ss6q.onrender.com"
//! ffmpeg = "ffmpeg"
//! transcode_timeout = 120
//! ```
//!
//! Every key is optional. Without `api_url` and `api_key` the legacy API
//! is disabled and URL validation always fails.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[serde(default)]
pub struct Config {
    /// Root for all intermediate and final download artifacts.
    pub downloads_dir: PathBuf,

    /// Base URL of the legacy metadata API.
    pub api_url: Option<Url>,

    /// Key sent to the legacy metadata API.
    #[redact]
    pub api_key: Option<String>,

    /// Base URL of the primary search and bulk download API.
    pub primary_api_url: Url,

    /// Program used to repack decrypted streams.
    pub ffmpeg: PathBuf,

    /// Deadline for a single repack.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub transcode_timeout: Duration,

    #[serde(skip)]
    pub user_agent: String,
}

impl Config {
    /// Configuration files should be small; anything larger is refused
    /// before reading it into memory.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    const PRIMARY_API_URL: &'static str = "https://spotify-dl-ss6q.onrender.com";

    const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(120);

    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, larger than 64 KiB, or not
    /// valid TOML for this structure.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.user_agent = Self::user_agent();

        Ok(config)
    }

    /// Whether the legacy API is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.api_url.is_some() && self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Builds the `User-Agent` header value.
    ///
    /// # Panics
    ///
    /// Panics if the package name or version contain characters that are
    /// illegal in a product token.
    fn user_agent() -> String {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");

        let illegal_chars = |chr| chr == '/' || chr == ';';
        assert!(
            !(app_name.is_empty() || app_name.contains(illegal_chars)),
            "application name invalid (\"{app_name}\")"
        );
        assert!(
            !(app_version.is_empty() || app_version.contains(illegal_chars)),
            "application version invalid (\"{app_version}\")"
        );

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version()
            .filter(|version| !version.is_empty() && !version.contains(illegal_chars))
            .unwrap_or_else(|| String::from("0"));

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        user_agent
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            api_url: None,
            api_key: None,
            primary_api_url: Url::parse(Self::PRIMARY_API_URL)
                .expect("invalid primary api url"),
            ffmpeg: PathBuf::from("ffmpeg"),
            transcode_timeout: Self::TRANSCODE_TIMEOUT,
            user_agent: Self::user_agent(),
        }
    }
}
