//! Terminal output for the CLI
//!
//! Uses `cliclack` for spinners and prompts when attached to a terminal and
//! falls back to plain lines in CI or when output is piped.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln::ui::{self, TaskSpinner, UiContext};
//!
//! let ctx = UiContext::detect();
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Building hello.c...");
//! spinner.stop("Built hello.c");
//!
//! ui::diagnostics(&ctx, &result.diagnostics);
//! ```

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{
    diagnostics, intro, key_value, remark, section, step_info, step_ok, step_ok_detail, step_warn,
    step_warn_hint,
};
pub use progress::TaskSpinner;
pub use prompts::confirm;
