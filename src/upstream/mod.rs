//! Access to the upstream podcast catalog API

pub mod auth;
pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod wire;

pub use auth::{AuthToken, IssuedToken};
pub use client::{UpstreamClient, UpstreamOptions};
pub use wire::{ApiEpisode, ApiPodcast, Page, parse_date};
