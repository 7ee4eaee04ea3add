// Library exports for shuge
// This allows integration tests and external code to use shuge modules

pub mod activity;
pub mod auth;
pub mod blob;
pub mod cache;
pub mod clicks;
pub mod config;
pub mod content;
pub mod db;
pub mod envelope;
pub mod error;
pub mod extractors;
pub mod ingest;
pub mod novels;
pub mod parser;
pub mod recommend;
pub mod review;
pub mod routes;
pub mod social;
pub mod state;
pub mod workers;
