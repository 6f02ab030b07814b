pub mod assets;
pub mod broadcasts;
pub mod campaigns;
pub mod config;
pub mod contacts;
pub mod db;
pub mod delivery;
pub mod error;
pub mod flows;
pub mod ivr;
pub mod jobs;
pub mod locks;
pub mod models;
pub mod msgs;
pub mod retry;
pub mod routes;
pub mod schema;
pub mod shared;
pub mod state;
pub mod triggers;
pub mod workers;

pub use workers::{default_handlers, Worker};
