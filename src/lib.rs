pub mod config;
pub mod db;
pub mod error;
pub mod matcher;
mod migrations;
pub mod net;
pub mod normalize;
pub mod provider;
pub mod server;
pub mod sources;
pub mod sync;
