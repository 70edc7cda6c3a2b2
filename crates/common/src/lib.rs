//! Error and report types shared between the `tenant-guard` library and its tools.

pub mod error;
pub mod protocol;

pub use error::GuardError;
