//! Response decoding for the metadata APIs.
//!
//! Both the primary and the legacy API wrap track lists in the same
//! envelope:
//!
//! ```json
//! {
//!     "results": [
//!         { "id": "4uLU6hMCjMI75M1A2tKUQC", "platform": "spotify", ... },
//!         ...
//!     ]
//! }
//! ```
//!
//! Single-track lookups return a bare track object.
//!
//! # Decoding Rules
//!
//! * A payload without a `results` key is unusable
//! * Entries that are not JSON objects are silently dropped
//! * Object entries must decode as a [`Track`]; a malformed one fails the
//!   whole payload with `InvalidArgument`
//! * A payload left with zero tracks is `NotFound`, never an empty list

use serde::Deserialize;
use serde_json::Value;
use std::fmt::Debug;

use crate::{
    error::{Error, Result},
    track::Track,
};

/// Key of the track list in a response envelope.
const RESULTS: &str = "results";

/// Decodes and logs a JSON response.
///
/// # Logging
///
/// * Success: Logs decoded structure at TRACE level
/// * Failure: Logs the raw JSON at TRACE level and the error at ERROR level
///
/// # Errors
///
/// Returns `InvalidArgument` if the JSON structure doesn't match type `T`.
pub fn json<T>(value: Value, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let raw = log_enabled!(log::Level::Trace).then(|| value.clone());
    match serde_json::from_value(value) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            error!("{origin}: failed parsing response ({e})");
            if let Some(raw) = raw {
                trace!("{origin}: {raw:#}");
            }
            Err(Error::invalid_argument(format!("{origin}: {e}")))
        }
    }
}

/// Decodes the track list of a `results` envelope.
///
/// # Errors
///
/// * `NotFound` if the payload has no usable tracks
/// * `InvalidArgument` if an object entry is not a valid track
pub fn tracks(value: Value, origin: &str) -> Result<Vec<Track>> {
    let Value::Object(mut map) = value else {
        return Err(Error::not_found(format!("{origin}: response is not an object")));
    };

    let Some(results) = map.remove(RESULTS) else {
        return Err(Error::not_found(format!("{origin}: response has no {RESULTS}")));
    };

    let entries = match results {
        Value::Array(entries) => entries,
        other => {
            debug!("{origin}: {RESULTS} is not a list: {other}");
            Vec::new()
        }
    };

    let tracks = entries
        .into_iter()
        .filter(Value::is_object)
        .map(|entry| json::<Track>(entry, origin))
        .collect::<Result<Vec<_>>>()?;

    if tracks.is_empty() {
        return Err(Error::not_found(format!("{origin}: no results")));
    }

    Ok(tracks)
}
