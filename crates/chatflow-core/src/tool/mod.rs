//! Tool registry abstractions.
//!
//! - `ToolRegistry`: RPITIT trait implemented by the host application
//! - `BoxToolRegistry`: shareable wrapper for dynamic dispatch

pub mod box_registry;
pub mod registry;
