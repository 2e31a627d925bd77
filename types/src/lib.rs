//! Core domain types for Tether.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

mod diagnostic;
mod position;

pub use diagnostic::{Diagnostic, DiagnosticSeverity, DiagnosticTag, ParseSeverityError};
pub use position::{Point, Range};
