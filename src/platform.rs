//! URL recognition for the supported streaming platforms.
//!
//! Recognized shapes, all case-insensitive, with an optional scheme and an
//! optional trailing query string:
//!
//! * Apple Music: `music.apple.com/[cc/]{album,playlist,song}/<slug>/<id>`
//! * Spotify: `open.spotify.com/{track,playlist,album,artist}/<id>`
//! * SoundCloud: `soundcloud.com/<user>/<track>`

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::track::Platform;

static URL_PATTERNS: LazyLock<[(Platform, Regex); 3]> = LazyLock::new(|| {
    let pattern = |re: &str| Regex::new(re).expect("invalid platform url pattern");
    [
        (
            Platform::AppleMusic,
            pattern(
                r"(?i)^(https?://)?(music\.apple\.com/([a-z]{2}/)?(album|playlist|song)/[a-zA-Z0-9\-_]+/[0-9]+)(\?.*)?$",
            ),
        ),
        (
            Platform::Spotify,
            pattern(
                r"(?i)^(https?://)?(open\.spotify\.com/(track|playlist|album|artist)/[a-zA-Z0-9]+)(\?.*)?$",
            ),
        ),
        (
            Platform::SoundCloud,
            pattern(r"(?i)^(https?://)?(soundcloud\.com/[a-zA-Z0-9\-_]+/[a-zA-Z0-9\-_]+)(\?.*)?$"),
        ),
    ]
});

impl Platform {
    /// Returns the platform whose URL shape `url` matches, if any.
    ///
    /// This only looks at the shape of the URL; whether the metadata API
    /// can actually be queried is decided by
    /// [`ApiData::is_valid`](crate::api::ApiData::is_valid).
    #[must_use]
    pub fn classify(url: &str) -> Option<Self> {
        URL_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(url))
            .map(|(platform, _)| *platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_urls() {
        assert_eq!(
            Platform::classify("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"),
            Some(Platform::Spotify)
        );
        assert_eq!(
            Platform::classify("https://music.apple.com/us/album/x/123456789"),
            Some(Platform::AppleMusic)
        );
        assert_eq!(
            Platform::classify("soundcloud.com/some-artist/some_track"),
            Some(Platform::SoundCloud)
        );
    }

    #[test]
    fn tolerates_case_and_query() {
        assert_eq!(
            Platform::classify("HTTPS://OPEN.SPOTIFY.COM/playlist/37i9dQZF1DXcBWIGoYBM5M?si=abc"),
            Some(Platform::Spotify)
        );
        assert_eq!(
            Platform::classify("music.apple.com/playlist/mix/42"),
            Some(Platform::AppleMusic)
        );
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(Platform::classify("never gonna give you up"), None);
        assert_eq!(Platform::classify("https://open.spotify.com/show/abc"), None);
        assert_eq!(Platform::classify("https://soundcloud.com/only-user"), None);
        assert_eq!(Platform::classify(""), None);
    }
}
