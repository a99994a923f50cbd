//! Domain types - core business entities
//!
//! This module contains the canonical domain types used throughout the application.
//! These types represent the pipeline's state model and are independent of persistence
//! or CLI concerns.

pub mod config;
pub mod digest;
pub mod file;
