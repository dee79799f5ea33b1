//! Common types and shared interfaces
//!
//! This module contains the enums and traits used across the messaging core.

pub mod types;
pub mod traits;
