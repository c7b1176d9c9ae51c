//! A helper-driven templating library.
//!
//! Templates mix literal text with `{{...}}` tags: interpolated
//! expressions, assignments, block helpers with `{{else}}` chains,
//! partials (global, inline and dynamic) and comments. Rendering walks
//! the parsed tree against a mutable [`Context`]; [`precompile`] turns
//! the same tree into a reusable procedure that produces identical
//! output without re-parsing.
//!
//! ```
//! use helpmate::{Context, HelpmateEngine, TemplateInterface};
//! use serde_json::json;
//!
//! let engine = HelpmateEngine::new();
//! let mut context = Context::new();
//! context.insert("name", json!("World"));
//!
//! let output = engine.render("Hello {{name}}!", &mut context).unwrap();
//! assert_eq!(output, "Hello World!");
//! ```
//!
//! Rendering is synchronous, single-stack computation with no I/O and
//! no cancellation mechanism. In particular there is no recursion
//! guard: a self-referential partial or helper chain recurses until
//! resources are exhausted, and bounding template recursion is the
//! caller's responsibility.

mod ast;
mod builtins;
mod context;
mod engine;
mod error;
mod eval;
mod interface;
mod parser;
mod precompile;
mod render;
mod scan;
mod value;

// Crate-level imports to make convienent imports for the rest of the library.
pub(crate) use error::HelpmateResult;

// Public exports.
pub use context::{Context, ContextOverlay};
pub use engine::HelpmateEngine;
pub use error::{HelpmateError, ParseError, ParseErrorKind};
pub use interface::{Continuation, Helper, HelperOptions, Hook, TemplateInterface};
pub use precompile::{
    KnownHelpers, Precompiled, PrecompileOptions, SourceMapEntry, precompile,
};
pub use value::{truthy, value_to_string};

// Context values are plain JSON; re-exported so callers do not need a
// direct serde_json dependency for simple uses.
pub use serde_json::Value;
