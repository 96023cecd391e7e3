//! Java front-end built on tree-sitter-java.
//!
//! [`parser`] owns the grammar and syntax-error reporting, [`lower`] walks a
//! clean tree and emits the normalized fact stream.

mod lower;
mod parser;

pub use parser::parse_java;

#[cfg(test)]
mod tests;
