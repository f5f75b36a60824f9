//! Command text templating
//!
//! Command text in a procedure may reference resolved arguments, the captured
//! output of earlier steps and environment variables:
//!
//! - `{{ args.target }}`
//! - `{{ steps.recon.stdout }}`, `{{ steps.recon.exit_code }}`
//! - `{{ env.HOME }}`
//! - filters: `shell_escape`, `json`, `b64encode`, `b64decode`
//!
//! Undefined variables are errors, never empty strings.

mod context;
mod engine;
mod errors;
mod filters;

pub use context::TemplateContext;
pub use engine::TemplateEngine;
pub use errors::TemplateError;
