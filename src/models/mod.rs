//! Generator implementations

pub mod tiny;

pub use tiny::TinyGenerator;
