pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod services;
