//! # coursebot-core
//!
//! Core types, traits, configuration, and error handling shared by the
//! channel backends, the SQLite store, and the scheduling gateway.

pub mod config;
pub mod domain;
pub mod error;
pub mod message;
pub mod schedule;
pub mod state;
pub mod traits;
