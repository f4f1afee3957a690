//! HTTP retrieval for metadata APIs and CDNs.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting to stay friendly with third-party APIs
//! * Consistent timeouts and headers
//! * Streaming downloads that never leave a partial file under the final name
//!
//! The operations the rest of the crate needs are captured by the [`Fetch`]
//! trait, so that the facade and the orchestrator can be driven by another
//! implementation in tests.
//!
//! # Example
//!
//! ```rust
//! use tgmusic::http::{Client, Fetch};
//!
//! let client = Client::new(&config)?;
//! let json = client.request(url).await?;
//! let path = client.download(cdn_url, Some(downloads.join("abc"))).await?;
//! ```

use std::{
    future::Future,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::{FutureExt, StreamExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE},
    Method, Url,
};
use serde_json::Value;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Retrieval operations used by the facade and the orchestrator.
pub trait Fetch: Send + Sync {
    /// Performs a GET request and decodes the body as JSON.
    fn request(&self, url: Url) -> impl Future<Output = Result<Value>> + Send;

    /// Downloads `url` to disk and returns the path written.
    ///
    /// When `destination` has no extension, one is derived from the
    /// response `Content-Type`. Without a `destination` the file name is
    /// taken from the response and placed in the downloads directory.
    fn download(
        &self,
        url: Url,
        destination: Option<PathBuf>,
    ) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,

    /// Origin that receives the API key header.
    api_origin: Option<url::Origin>,

    api_key: Option<HeaderValue>,

    downloads_dir: PathBuf,
}

impl Client {
    /// Rolling window for the rate limiter.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum calls per interval. Requests beyond this limit are delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Duration to wait for individual network reads. A stalled CDN
    /// otherwise blocks the download task forever.
    const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Header carrying the legacy API key.
    const API_KEY_HEADER: &'static str = "X-API-Key";

    /// Suffix of files that are still being written.
    const PARTIAL_SUFFIX: &'static str = "part";

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * HTTP client creation fails
    /// * the API key is not a valid header value
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| Error::invalid_argument(e.to_string()))?
            .map(|mut value| {
                value.set_sensitive(true);
                value
            });
        let api_origin = config.api_url.as_ref().map(Url::origin);

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
            api_origin,
            api_key,
            downloads_dir: config.downloads_dir.clone(),
        })
    }

    /// Builds a GET request, attaching the API key when the request goes to
    /// the legacy API.
    pub fn get(&self, url: Url) -> reqwest::Request {
        let is_api = self
            .api_origin
            .as_ref()
            .is_some_and(|origin| *origin == url.origin());

        let mut request = reqwest::Request::new(Method::GET, url);
        if let (true, Some(key)) = (is_api, &self.api_key) {
            request
                .headers_mut()
                .insert(Self::API_KEY_HEADER, key.clone());
        }

        request
    }

    /// Executes a request with rate limiting.
    ///
    /// Responses with a non-success status are turned into errors.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Request execution fails
    /// * Network error occurs
    /// * The server responds with an error status
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + Send + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| {
            self.unlimited
                .execute(request)
                .map(|response| response.and_then(reqwest::Response::error_for_status))
                .map_err(Into::into)
        })
    }

    /// Picks the path a response body is written to.
    fn destination(
        &self,
        url: &Url,
        headers: &HeaderMap,
        destination: Option<PathBuf>,
    ) -> PathBuf {
        let mut path = destination.unwrap_or_else(|| {
            let name = file_name_from_disposition(headers)
                .or_else(|| {
                    url.path_segments()
                        .and_then(Iterator::last)
                        .filter(|segment| !segment.is_empty())
                        .map(ToOwned::to_owned)
                })
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            self.downloads_dir.join(name)
        });

        if path.extension().is_none() {
            if let Some(extension) = extension_from_content_type(headers) {
                path.set_extension(extension);
            }
        }

        path
    }
}

impl Fetch for Client {
    async fn request(&self, url: Url) -> Result<Value> {
        trace!("GET {url}");
        let response = self.execute(self.get(url)).await?;
        let json = response.json::<Value>().await?;
        Ok(json)
    }

    async fn download(&self, url: Url, destination: Option<PathBuf>) -> Result<PathBuf> {
        let host = url.host_str().unwrap_or_default().to_owned();
        let response = self.execute(self.get(url.clone())).await?;

        let path = self.destination(&url, response.headers(), destination);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&path, Self::PARTIAL_SUFFIX);
        debug!("downloading {} from {host}", path.display());

        if let Err(e) = write_body(response, &partial).await {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                warn!("error removing {}: {e}", partial.display());
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }
}

/// Resolves `path` relative to `base`, treating `base` as a directory even
/// without a trailing slash.
///
/// # Errors
///
/// Returns `InvalidArgument` if the result is not a valid URL.
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let directory = format!("{}/", base.path());
        base.set_path(&directory);
    }

    let url = base.join(path.trim_start_matches('/'))?;
    Ok(url)
}

/// Streams a response body into a new file at `path`.
async fn write_body(response: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    trace!("wrote {written} bytes to {}", path.display());
    Ok(written)
}

/// Appends `suffix` as an additional extension: `a.ogg` becomes `a.ogg.part`.
fn partial_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Extracts a bare file name from a `Content-Disposition` header.
fn file_name_from_disposition(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let name = value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?
        .trim_matches('"');

    // Never let the server pick a directory.
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
}

/// Maps a `Content-Type` header to a file extension.
fn extension_from_content_type(headers: &HeaderMap) -> Option<&'static str> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let mime = value.split(';').next()?.trim().to_ascii_lowercase();

    let extension = match mime.as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "application/zip" | "application/x-zip-compressed" => "zip",
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        _ => return None,
    };
    Some(extension)
}

/// A network-free [`Fetch`] for tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Answers URLs containing a pattern with canned JSON or files and
    /// records every call. Anything else is `Unavailable`.
    #[derive(Default)]
    pub struct Recorder {
        calls: Mutex<Vec<String>>,
        responses: Vec<(&'static str, Value)>,
        files: Vec<(&'static str, &'static str, Vec<u8>)>,
    }

    impl Recorder {
        #[must_use]
        pub fn responding(mut self, pattern: &'static str, value: Value) -> Self {
            self.responses.push((pattern, value));
            self
        }

        /// Serves `body` with a content type that maps to `extension`.
        #[must_use]
        pub fn serving(
            mut self,
            pattern: &'static str,
            extension: &'static str,
            body: impl Into<Vec<u8>>,
        ) -> Self {
            self.files.push((pattern, extension, body.into()));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, url: &Url) {
            self.calls.lock().unwrap().push(url.to_string());
        }
    }

    impl Fetch for Recorder {
        async fn request(&self, url: Url) -> Result<Value> {
            self.record(&url);
            self.responses
                .iter()
                .find(|(pattern, _)| url.as_str().contains(pattern))
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Error::unavailable(format!("{url} is offline")))
        }

        async fn download(&self, url: Url, destination: Option<PathBuf>) -> Result<PathBuf> {
            self.record(&url);

            let served = self
                .files
                .iter()
                .find(|(pattern, _, _)| url.as_str().contains(pattern));
            let Some((_, extension, body)) = served else {
                return Err(Error::unavailable(format!("{url} is offline")));
            };

            let mut path = destination.unwrap_or_else(|| PathBuf::from("download"));
            if path.extension().is_none() {
                path.set_extension(extension);
            }
            tokio::fs::write(&path, body).await?;
            Ok(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(reqwest::header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn client() -> Client {
        let config = Config {
            downloads_dir: PathBuf::from("/var/cache/tgmusic"),
            api_url: Some(Url::parse("https://api.example.com/v1").unwrap()),
            api_key: Some("secret".to_owned()),
            ..Config::default()
        };
        Client::new(&config).unwrap()
    }

    #[test]
    fn api_key_only_sent_to_api() {
        let client = client();

        let request = client.get(Url::parse("https://api.example.com/v1/search_track").unwrap());
        assert_eq!(request.headers().get("X-API-Key").unwrap(), "secret");

        let request = client.get(Url::parse("https://cdn.example.com/audio/abc").unwrap());
        assert!(request.headers().get("X-API-Key").is_none());
    }

    #[test]
    fn extension_follows_content_type() {
        let client = client();
        let url = Url::parse("https://cdn.example.com/download/").unwrap();

        let zip = headers(&[(CONTENT_TYPE, "application/zip")]);
        assert_eq!(
            client.destination(&url, &zip, Some(PathBuf::from("/tmp/abc"))),
            PathBuf::from("/tmp/abc.zip")
        );

        let mp3 = headers(&[(CONTENT_TYPE, "audio/mpeg; charset=binary")]);
        assert_eq!(
            client.destination(&url, &mp3, Some(PathBuf::from("/tmp/abc.ogg"))),
            PathBuf::from("/tmp/abc.ogg")
        );
    }

    #[test]
    fn disposition_names_are_sanitized() {
        let client = client();
        let url = Url::parse("https://cdn.example.com/download/").unwrap();

        let named = headers(&[(
            CONTENT_DISPOSITION,
            "attachment; filename=\"../../etc/song.mp3\"",
        )]);
        assert_eq!(
            client.destination(&url, &named, None),
            PathBuf::from("/var/cache/tgmusic/song.mp3")
        );
    }

    #[test]
    fn url_segment_names_unnamed_responses() {
        let client = client();
        let url = Url::parse("https://cdn.example.com/files/track.mp3?token=1").unwrap();

        assert_eq!(
            client.destination(&url, &HeaderMap::new(), None),
            PathBuf::from("/var/cache/tgmusic/track.mp3")
        );
    }

    #[test]
    fn endpoints_extend_base_path() {
        let base = Url::parse("https://api.example.com/v1").unwrap();
        assert_eq!(
            endpoint(&base, "search_track").unwrap().as_str(),
            "https://api.example.com/v1/search_track"
        );

        let base = Url::parse("https://api.example.com/").unwrap();
        assert_eq!(
            endpoint(&base, "/download/").unwrap().as_str(),
            "https://api.example.com/download/"
        );
    }

    #[test]
    fn partial_files_keep_their_name() {
        assert_eq!(
            partial_path(Path::new("/tmp/abc.encrypted.ogg"), "part"),
            PathBuf::from("/tmp/abc.encrypted.ogg.part")
        );
    }
}
