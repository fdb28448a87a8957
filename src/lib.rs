pub mod alerts;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod rollup;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod time;
