//! CLI policy shared by the gateway binaries.

mod color;

pub use color::ColorWhen;
