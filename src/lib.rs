pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod signature;
pub mod stats;
pub mod stream;
pub mod token;
pub mod transforms;
pub mod upstream;
