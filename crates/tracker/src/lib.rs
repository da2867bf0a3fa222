//! REST client for the issue tracker the engine reads from and writes to.

pub mod rest;

pub use rest::{RestTracker, RestTrackerError};
