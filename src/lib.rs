//! Music lookup and download core of a Telegram music bot.
//!
//! The crate resolves search queries and platform URLs to [`Track`]s
//! through two metadata services, and turns tracks into playable files:
//!
//! * [`api::ApiData`]: search, URL lookup, single tracks, recommendations
//!   and download dispatch
//! * [`spotify::SpotifyDownload`]: bulk downloads with a fallback to the
//!   legacy scheme of encrypted OGG streams
//! * [`decrypt`], [`ogg`] and [`transcode`]: the decrypt, repair and
//!   repack steps of that legacy scheme
//!
//! Network access goes through the [`http::Fetch`] trait and configuration
//! is passed explicitly as a [`config::Config`].
//!
//! [`Track`]: track::Track
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod api;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod http;
pub mod ogg;
pub mod platform;
pub mod protocol;
pub mod spotify;
pub mod track;
pub mod transcode;
