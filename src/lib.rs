//! Mail Autopilot — rule-driven email automation engine.

pub mod config;
pub mod email;
pub mod engine;
pub mod error;
pub mod llm;
pub mod provider;
pub mod rules;
pub mod store;
pub mod sweep;
pub mod tracker;

pub use error::{Error, Result};
