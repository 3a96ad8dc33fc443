//! # Metadata Resolution
//!
//! Best-effort lookup of display metadata (title, artist, album, artwork)
//! for injected items.
//!
//! ## Overview
//!
//! - [`MetadataResolver`] asks providers in a fixed priority order, each under
//!   its own timeout, and falls through on failure
//! - Providers: MusicBrainz with Cover Art Archive artwork, then Last.fm
//! - Results, including "not found", are cached with a TTL
//!
//! Absence of metadata is never an error for callers. The injection pipeline
//! falls back to a title derived from the submitted file name.

pub mod cache;
pub mod error;
pub mod providers;
pub mod resolver;
pub mod types;

pub use error::{MetadataError, Result};
pub use providers::MetadataProvider;
pub use resolver::MetadataResolver;
pub use types::{MetadataQuery, MetadataQueryResult, ResolvedMetadata};
