//! Jinja template resolution for Reflow models
//!
//! Resolution is explicitly two-phase:
//! - Parse: render once with capturing `ref`/`source`/`config` functions to
//!   obtain a typed reference list and the model's config block
//! - Render: resolve every reference through the catalog, then render the
//!   body with the resolved relation names substituted
//!
//! Hooks are rendered with `this` bound to the model's relation.

pub mod context;
pub mod functions;
pub mod parser;
pub mod resolver;

pub use context::{RenderContext, TargetContext};
pub use functions::TemplateReference;
pub use parser::{ParsedTemplate, TemplateParser, TemplateError};
pub use resolver::{TemplateResolver, ResolvedReferences, RenderedModel, ResolveError};
