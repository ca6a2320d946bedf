//! HTTP command surface for spawnwatch.
//!
//! A thin JSON layer over [`spawnwatch_tracker::Tracker`] for:
//! - Adding, listing and removing tracked bosses
//! - Reporting kills and misses
//! - Answering spawn alerts
//! - Setting a group's default alert channel

mod error;
mod routes;

pub use error::WebError;
pub use routes::{AppState, create_router};
