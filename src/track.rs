//! Track descriptors as returned by the metadata APIs.
//!
//! A [`Track`] is decoded from one entry of a `results` payload and is
//! read-only afterwards. It carries everything needed to obtain playable
//! bytes: either a CDN URL (plus a decryption key for the legacy Spotify
//! scheme) or an identity that the bulk download API can resolve.
//!
//! # Wire Format
//!
//! ```json
//! {
//!     "platform": "spotify",
//!     "id": "4uLU6hMCjMI75M1A2tKUQC",
//!     "url": "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC",
//!     "name": "Never Gonna Give You Up",
//!     "artist": "Rick Astley",
//!     "duration": 213,
//!     "cdnurl": "https://audio-ak.spotifycdn.com/...",
//!     "key": "0123456789abcdef0123456789abcdef",
//!     "tc": "4uLU6hMCjMI75M1A2tKUQC"
//! }
//! ```

use std::{fmt, ops::Deref, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer};
use serde_with::{
    formats::Flexible, serde_as, DisplayFromStr, DurationSeconds, NoneAsEmptyString,
    PickFirst,
};
use url::Url;
use uuid::Uuid;
use veil::Redact;

use crate::error::{Error, Result};

/// Streaming platform a track originates from.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Platform {
    Spotify,
    AppleMusic,
    SoundCloud,
    #[default]
    Other,
}

impl FromStr for Platform {
    type Err = Error;

    /// Parses a platform name case-insensitively. Names that are not
    /// recognized map to [`Platform::Other`].
    fn from_str(s: &str) -> Result<Self> {
        let platform = match s.trim().to_ascii_lowercase().as_str() {
            "spotify" => Self::Spotify,
            "apple_music" | "applemusic" | "apple" => Self::AppleMusic,
            "soundcloud" => Self::SoundCloud,
            _ => Self::Other,
        };
        Ok(platform)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Spotify => "spotify",
            Self::AppleMusic => "apple_music",
            Self::SoundCloud => "soundcloud",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// External identifier of a track on its platform.
///
/// Upstream APIs send it either as a string or as a number.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TrackId(String);

impl TrackId {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for TrackId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TrackId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.trim().to_owned(),
            Raw::Number(number) => number.to_string(),
        };
        Ok(Self(id))
    }
}

/// Normalized record of a resolvable track.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct Track {
    /// Platform the track was resolved on.
    #[serde(default)]
    #[serde_as(as = "DisplayFromStr")]
    pub platform: Platform,

    /// Identifier on the platform.
    #[serde(default)]
    pub id: TrackId,

    /// Canonical URL on the platform.
    #[serde(default)]
    pub url: String,

    #[serde(default, alias = "title")]
    pub name: String,

    #[serde(default)]
    pub artist: String,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub album: Option<String>,

    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub cover: Option<Url>,

    #[serde(default)]
    #[serde_as(as = "DurationSeconds<String, Flexible>")]
    pub duration: Duration,

    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub year: Option<u16>,

    /// Direct download location, absent for tracks that must be resolved
    /// through the bulk download API.
    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    pub cdnurl: Option<Url>,

    /// Hex-encoded decryption key of the legacy Spotify scheme.
    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    #[redact]
    pub key: Option<String>,

    /// Cache-key token naming every on-disk artifact of this track.
    #[serde(default)]
    #[serde_as(as = "NoneAsEmptyString")]
    tc: Option<String>,
}

impl Track {
    /// The cache-key token naming every on-disk artifact of this track.
    ///
    /// Falls back to the identifier when the API did not send a token, and
    /// to a name derived from the canonical or CDN URL when it sent
    /// neither. Path separators are replaced.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the track has no token, identifier or
    /// URL to derive one from.
    pub fn cache_token(&self) -> Result<String> {
        if let Some(token) = self.explicit_token() {
            return Ok(token.replace(['/', '\\'], "_"));
        }

        let url = Some(self.url.as_str())
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.cdnurl.as_ref().map(Url::as_str))
            .ok_or_else(|| Error::invalid_argument("track has no token, id or url"))?;

        Ok(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string())
    }

    /// The Spotify identifier, falling back to the token the API sent.
    #[must_use]
    pub fn spotify_id(&self) -> Option<&str> {
        if !self.is_spotify() {
            return None;
        }

        Some(&*self.id)
            .filter(|id| !id.is_empty())
            .or(self.tc.as_deref())
    }

    fn explicit_token(&self) -> Option<&str> {
        self.tc
            .as_deref()
            .or(Some(&*self.id))
            .filter(|token| !token.is_empty())
    }

    #[must_use]
    pub fn is_spotify(&self) -> bool {
        self.platform == Platform::Spotify
    }

    #[must_use]
    pub fn is_playlist(&self) -> bool {
        self.url.to_ascii_lowercase().contains("playlist")
    }

    /// Whether any path can produce bytes for this track: a CDN URL, or a
    /// Spotify identity the bulk download API can resolve.
    #[must_use]
    pub fn is_downloadable(&self) -> bool {
        self.cdnurl.is_some()
            || self.spotify_id().is_some()
            || (self.is_spotify() && self.is_playlist())
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let token = self.explicit_token().unwrap_or("?");
        if self.artist.is_empty() {
            write!(f, "{token}: \"{}\"", self.name)
        } else {
            write!(f, "{token}: \"{} - {}\"", self.artist, self.name)
        }
    }
}
