//! Flow event distribution.
//!
//! `EventBus` fans `FlowEvent`s out to every subscriber; `RequestEvents`
//! follows a single request until its terminal event.

pub mod bus;

pub use bus::{EventBus, RequestEvents};
