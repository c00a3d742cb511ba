//! Test fixtures for shoal: canned job handlers, recording listeners and
//! initializers, and polling helpers.

mod handler;
mod mock;
mod wait;

pub use handler::*;
pub use mock::*;
pub use wait::*;
