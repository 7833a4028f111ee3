//! Utility modules shared by the IR, analyses and transforms:
//! - Error types
//! - Source location tracking
//! - Loop name interning

pub mod errors;
pub mod intern;
pub mod location;

pub use errors::*;
pub use intern::{intern, Symbol};
pub use location::{SourceLocation, Span};
