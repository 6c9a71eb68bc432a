//! Route planning around blocked haciendas, with progress tracking along the
//! chosen route.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod geo_index;
pub mod math;
pub mod model;
pub mod navigator;
pub mod provider;
pub mod route_store;
pub mod tracker;
pub mod trail;
pub mod zones;

pub use error::Error;
