//! Platform API facade.
//!
//! [`ApiData`] answers the questions a chat front end asks about music:
//! what a query or URL refers to, what the details of a track are, and
//! where its audio lives on disk.
//!
//! Two upstream services are involved:
//!
//! * The **primary API** (`primary_api_url`): open search and bulk
//!   downloads. It is tried first for searches and URL lookups; its
//!   failures are logged and never propagated.
//! * The **legacy API** (`api_url` with `api_key`): search, URL lookup,
//!   single tracks and recommendations. Without credentials every legacy
//!   call fails with `FailedPrecondition`.
//!
//! # Example
//!
//! ```rust
//! let api = ApiData::new(Arc::new(Client::new(&config)?), config);
//! let tracks = api.search("never gonna give you up").await?;
//! let files = api.download_track(tracks[0].clone()).await?;
//! ```

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    http::{self, Fetch},
    protocol,
    spotify::{Downloaded, SpotifyDownload},
    track::{Platform, Track},
};

/// Facade over the metadata APIs and the download paths.
pub struct ApiData<F> {
    client: Arc<F>,
    config: Config,
}

impl<F> ApiData<F>
where
    F: Fetch,
{
    /// Number of recommendations when the caller has no preference.
    pub const DEFAULT_RECOMMENDATIONS: usize = 4;

    #[must_use]
    pub fn new(client: Arc<F>, config: Config) -> Self {
        Self { client, config }
    }

    /// Trims whitespace and cuts the query string and fragment.
    #[must_use]
    pub fn sanitize_query(query: &str) -> &str {
        let query = query.trim();
        let end = query.find(['?', '#']).unwrap_or(query.len());
        &query[..end]
    }

    /// Whether `url` belongs to a supported platform and the legacy API
    /// can be asked about it.
    #[must_use]
    pub fn is_valid(&self, url: &str) -> bool {
        !url.is_empty() && self.config.has_credentials() && Platform::classify(url).is_some()
    }

    /// Resolves a free-text query or a platform URL to tracks.
    ///
    /// URLs are looked up with [`get_info`](Self::get_info). Text is
    /// searched on the primary API first and on the legacy API when that
    /// fails or finds nothing.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if the query is empty after sanitizing
    /// * `NotFound` if nothing matched
    /// * `FailedPrecondition` if the primary API failed and the legacy API
    ///   is not configured
    pub async fn search(&self, query: &str) -> Result<Vec<Track>> {
        let query = Self::sanitize_query(query);
        if query.is_empty() {
            return Err(Error::invalid_argument("query is empty"));
        }

        if self.is_valid(query) {
            return self.get_info(query).await;
        }

        match self.primary("search", query).await {
            Ok(tracks) => return Ok(tracks),
            Err(e) => warn!("primary search for \"{query}\" failed: {e}"),
        }

        let response = self.legacy("search_track", &[("q", query)]).await?;
        protocol::tracks(response, "search_track")
    }

    /// Looks up the tracks behind a platform URL.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if the URL is not supported or the legacy API is
    ///   not configured
    /// * `NotFound` if neither API knows the URL
    pub async fn get_info(&self, url: &str) -> Result<Vec<Track>> {
        let url = Self::sanitize_query(url);
        if !self.is_valid(url) {
            return Err(Error::invalid_argument(format!("unsupported url \"{url}\"")));
        }

        match self.primary("search/", url).await {
            Ok(tracks) => return Ok(tracks),
            Err(e) => warn!("primary lookup of {url} failed: {e}"),
        }

        let response = self.legacy("get_url", &[("url", url)]).await?;
        protocol::tracks(response, "get_url")
    }

    /// Fetches the full descriptor of a single track, including its
    /// download fields.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if `id` is empty or the response is malformed
    /// * `FailedPrecondition` if the legacy API is not configured
    pub async fn get_track(&self, id: &str) -> Result<Track> {
        let id = Self::sanitize_query(id);
        if id.is_empty() {
            return Err(Error::invalid_argument("track id is empty"));
        }

        let response = self.legacy("get_track", &[("id", id)]).await?;
        protocol::json(response, "get_track")
    }

    /// Fetches up to `limit` recommended tracks.
    ///
    /// # Errors
    ///
    /// * `NotFound` if nothing was recommended
    /// * `FailedPrecondition` if the legacy API is not configured
    pub async fn recommendations(&self, limit: usize) -> Result<Vec<Track>> {
        let limit = limit.to_string();
        let response = self.legacy("recommend_songs", &[("lim", &limit)]).await?;
        protocol::tracks(response, "recommend_songs")
    }

    /// Downloads the audio of a track.
    ///
    /// Spotify tracks go through [`SpotifyDownload`]. Tracks of other
    /// platforms are fetched from their CDN URL to `<token>.mp3`, see
    /// [`Track::cache_token`].
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if the track has no token, id or URL
    /// * `NotFound` if a non-Spotify track has no CDN URL
    /// * any error of the download itself
    pub async fn download_track(&self, track: Track) -> Result<Downloaded> {
        if track.is_spotify() {
            let download = SpotifyDownload::new(Arc::clone(&self.client), &self.config, track)?;
            return download.process().await;
        }

        let Some(cdnurl) = track.cdnurl.clone() else {
            error!("no download url for {track}");
            return Err(Error::not_found(format!("{track} has no download url")));
        };

        let token = track.cache_token()?;
        let destination = self.config.downloads_dir.join(format!("{token}.mp3"));
        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            info!("found existing file {}", destination.display());
            return Ok(Downloaded::File(destination));
        }

        let path = self
            .client
            .download(cdnurl, Some(destination))
            .await
            .inspect_err(|e| error!("download of {track} failed: {e}"))?;
        Ok(Downloaded::File(path))
    }

    /// Queries the primary API with `q`.
    async fn primary(&self, endpoint: &str, query: &str) -> Result<Vec<Track>> {
        let mut url = http::endpoint(&self.config.primary_api_url, endpoint)?;
        url.query_pairs_mut().append_pair("q", query);

        let response = self.client.request(url).await?;
        protocol::tracks(response, endpoint)
    }

    /// Calls a legacy endpoint. The API key travels in a header added by
    /// the client.
    async fn legacy(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value> {
        let Some(url) = self.legacy_url(endpoint)? else {
            debug!("legacy api not configured, skipping {endpoint}");
            return Err(Error::failed_precondition("legacy api not configured"));
        };

        let url = Url::parse_with_params(url.as_str(), params)?;
        self.client.request(url).await
    }

    fn legacy_url(&self, endpoint: &str) -> Result<Option<Url>> {
        if !self.config.has_credentials() {
            return Ok(None);
        }

        self.config
            .api_url
            .as_ref()
            .map(|base| http::endpoint(base, endpoint))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{error::ErrorKind, http::testing::Recorder};

    fn config(credentials: bool) -> Config {
        let mut config = Config {
            primary_api_url: Url::parse("https://primary.example.com").unwrap(),
            ..Config::default()
        };
        if credentials {
            config.api_url = Some(Url::parse("https://api.example.com/v1/").unwrap());
            config.api_key = Some("secret".to_owned());
        }
        config
    }

    fn results(ids: &[&str]) -> Value {
        let results: Vec<_> = ids
            .iter()
            .map(|id| json!({"platform": "spotify", "id": id, "name": id}))
            .collect();
        json!({ "results": results })
    }

    fn ids(tracks: &[Track]) -> Vec<String> {
        tracks.iter().map(|track| track.id.to_string()).collect()
    }

    #[test]
    fn sanitizes_queries() {
        type Api = ApiData<Recorder>;

        assert_eq!(
            Api::sanitize_query("  https://x/y?si=1#frag  "),
            "https://x/y"
        );
        assert_eq!(Api::sanitize_query("plain text"), "plain text");
        assert_eq!(Api::sanitize_query("a#b?c"), "a");
        assert_eq!(Api::sanitize_query("   "), "");
    }

    #[test]
    fn validity_requires_credentials() {
        let url = "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC";

        let api = ApiData::new(Arc::new(Recorder::default()), config(false));
        assert!(!api.is_valid(url));

        let api = ApiData::new(Arc::new(Recorder::default()), config(true));
        assert!(api.is_valid(url));
        assert!(!api.is_valid("https://example.com/track/1"));
        assert!(!api.is_valid(""));
    }

    #[tokio::test]
    async fn primary_search_wins() {
        let client = Arc::new(
            Recorder::default()
                .responding("primary.example.com/search?", results(&["a", "b"]))
                .responding("search_track", results(&["legacy"])),
        );
        let api = ApiData::new(client.clone(), config(true));

        assert_eq!(ids(&api.search("rick astley").await.unwrap()), ["a", "b"]);
        assert_eq!(
            client.calls(),
            ["https://primary.example.com/search?q=rick+astley"]
        );
    }

    #[tokio::test]
    async fn failing_primary_search_falls_back() {
        let client = Arc::new(Recorder::default().responding("search_track", results(&["legacy"])));
        let api = ApiData::new(client.clone(), config(true));

        assert_eq!(ids(&api.search("rick astley").await.unwrap()), ["legacy"]);
        assert_eq!(
            client.calls(),
            [
                "https://primary.example.com/search?q=rick+astley",
                "https://api.example.com/v1/search_track?q=rick+astley",
            ]
        );
    }

    #[tokio::test]
    async fn empty_primary_search_falls_back() {
        let client = Arc::new(
            Recorder::default()
                .responding("primary.example.com", json!({"results": []}))
                .responding("search_track", results(&["legacy"])),
        );
        let api = ApiData::new(client, config(true));

        assert_eq!(ids(&api.search("rick astley").await.unwrap()), ["legacy"]);
    }

    #[tokio::test]
    async fn search_without_legacy_api_is_failed_precondition() {
        let api = ApiData::new(Arc::new(Recorder::default()), config(false));

        let err = api.search("rick astley").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn urls_are_looked_up() {
        let client = Arc::new(Recorder::default().responding("get_url", results(&["x"])));
        let api = ApiData::new(client.clone(), config(true));

        let tracks = api
            .search("https://open.spotify.com/track/abc?si=123")
            .await
            .unwrap();
        assert_eq!(ids(&tracks), ["x"]);

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("https://primary.example.com/search/?q="));
        assert_eq!(
            calls[1],
            "https://api.example.com/v1/get_url?url=https%3A%2F%2Fopen.spotify.com%2Ftrack%2Fabc"
        );
    }

    #[tokio::test]
    async fn single_track_is_decoded() {
        let client = Arc::new(Recorder::default().responding(
            "get_track?id=abc",
            json!({"platform": "spotify", "id": "abc", "name": "song", "duration": 200}),
        ));
        let api = ApiData::new(client, config(true));

        let track = api.get_track("abc").await.unwrap();
        assert_eq!(track.name, "song");
        assert!(track.is_spotify());
    }

    #[tokio::test]
    async fn recommendations_pass_limit() {
        let client = Arc::new(Recorder::default().responding("recommend_songs", results(&["r"])));
        let api = ApiData::new(client.clone(), config(true));

        let tracks = api
            .recommendations(ApiData::<Recorder>::DEFAULT_RECOMMENDATIONS)
            .await
            .unwrap();
        assert_eq!(ids(&tracks), ["r"]);
        assert_eq!(
            client.calls(),
            ["https://api.example.com/v1/recommend_songs?lim=4"]
        );
    }

    #[tokio::test]
    async fn other_platforms_download_from_cdn() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            downloads_dir: dir.path().to_path_buf(),
            ..config(true)
        };
        let client = Arc::new(Recorder::default().serving("cdn.example.com", "mp3", b"ID3".to_vec()));
        let api = ApiData::new(client, config);

        let track: Track = serde_json::from_value(json!({
            "platform": "soundcloud",
            "id": 7,
            "tc": "sc7",
            "cdnurl": "https://cdn.example.com/sc7",
        }))
        .unwrap();
        assert_eq!(
            api.download_track(track).await.unwrap(),
            Downloaded::File(dir.path().join("sc7.mp3"))
        );

        let track: Track =
            serde_json::from_value(json!({"platform": "soundcloud", "id": 8})).unwrap();
        assert_eq!(
            api.download_track(track).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn tracks_without_token_download_to_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            downloads_dir: dir.path().to_path_buf(),
            ..config(true)
        };
        let client = Arc::new(
            Recorder::default()
                .serving("cdn.example.com/first", "mp3", b"first".to_vec())
                .serving("cdn.example.com/second", "mp3", b"second".to_vec()),
        );
        let api = ApiData::new(client, config);

        let mut paths = Vec::new();
        for name in ["first", "second"] {
            let track: Track = serde_json::from_value(json!({
                "platform": "soundcloud",
                "cdnurl": format!("https://cdn.example.com/{name}"),
            }))
            .unwrap();
            let Downloaded::File(path) = api.download_track(track).await.unwrap() else {
                panic!("expected a single file");
            };
            assert_eq!(path.parent().unwrap(), dir.path());
            paths.push(path);
        }

        assert_ne!(paths[0], paths[1]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"first");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"second");
    }
}
