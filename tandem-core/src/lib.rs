//! # tandem-core - document content for Tandem
//!
//! The sync protocol in `tandem-collab` is content-agnostic. This crate holds
//! the [`ContentCapability`] seam and the two content shapes Tandem edits:
//!
//! - [`text`]: linear operation stream (insert/delete by character position)
//! - [`canvas`]: ordered element set keyed by element id
//!
//! ```text
//! ┌──────────────┐  apply_op / diff   ┌───────────────┐
//! │ EditSession  │ ─────────────────► │ TextContent   │
//! │ (collab)     │  rebase / merge    │ CanvasContent │
//! └──────────────┘                    └───────────────┘
//! ```

pub mod canvas;
pub mod content;
pub mod text;

pub use canvas::{Canvas, CanvasContent, CanvasOp, Element, ElementKind, Rect};
pub use content::{ContentCapability, ContentError, ContentKind};
pub use text::{TextContent, TextOp};
