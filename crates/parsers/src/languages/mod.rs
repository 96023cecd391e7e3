//! Front-ends, one module per input format.
//!
//! Each front-end exposes a `parse_<format>` function returning a complete
//! [`ir::SourceUnit`].

pub mod facts;
pub use facts::parse_facts;

pub mod java;
pub use java::parse_java;
