//! ModForge - a CLI mod manager for Factorio
//!
//! This crate provides:
//! - Mod portal integration for checking and downloading releases
//! - Recursive dependency resolution with version constraints
//! - Batched concurrent updates with progress reporting
//! - mod-list.json enable state management

pub const APP_VERSION: &str = "0.3.2";

pub mod app;
pub mod cache;
pub mod config;
pub mod deps;
pub mod mods;
pub mod portal;
pub mod ui;
pub mod update;

pub use app::App;
pub use config::Config;
