//! Shared infrastructure for the CAPI phone workspace.
//!
//! Holds the pieces every crate in the workspace wants to behave the same
//! way: log initialization, terminal color policy and the metrics registry.

pub mod color;
pub mod observability;

pub use color::ColorWhen;
pub use observability::{init_tracing, MetricsContext};
