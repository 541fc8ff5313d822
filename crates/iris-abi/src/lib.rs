//! Iris ABI crate: contracts shared by the coordinator and native engine plugins.

pub mod engine;
pub mod error;
pub mod ffi;
pub mod sampling;

pub use engine::*;
pub use error::*;
pub use sampling::*;
