//! # coursebot-memory
//!
//! SQLite-backed implementations of the coursebot store traits.

pub mod store;

pub use store::Store;
