#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod accumulator;
pub mod constants;
pub mod db;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod metadata;
pub mod provider;
pub mod realtime;
pub mod reconcile;
pub mod relay;
pub mod sessions;
pub mod sse;
pub mod str_utils;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
