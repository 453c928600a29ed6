//! Infrastructure layer for chatflow.
//!
//! Contains implementations of the ports defined in `chatflow-core`:
//! JSON session files with a listing cache, the TOML configuration loader
//! and data-directory resolution, and the default provider patch.

pub mod config;
pub mod persistence;
pub mod provider_patch;
