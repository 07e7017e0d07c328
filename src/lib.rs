//! devmux - a development-time HTTP front door
//!
//! Given a directory whose children are application folders, devmux:
//! - Routes inbound HTTP traffic by Host header to the matching app folder
//! - Launches the app's Procfile `web:` process on the first request
//! - Proxies traffic (including WebSocket upgrades) to the child process
//! - Reloads the app when files matched by its `.watch` patterns change
//! - Serves Procfile-less folders as static files
//! - Stops apps that have seen no traffic past a configurable idle TTL

pub mod app;
pub mod config;
pub mod error;
pub mod files;
pub mod install;
pub mod ports;
pub mod procfile;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod rules;
pub mod server;
pub mod watcher;
