pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod fetch_service;
pub mod logging;
pub mod server;
pub mod state;
