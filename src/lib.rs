//! Resilient client gateway for the Spotify Web API: token lifecycle,
//! deduplicated and cached requests with one retry policy, and adaptive
//! polling of playback state.
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod poller;
pub mod store;
pub mod token;
