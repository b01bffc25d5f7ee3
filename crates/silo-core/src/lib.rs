pub mod config;
pub mod dispatch;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod plugins;
pub mod registry;
pub mod runtime;
pub mod sqlite;
