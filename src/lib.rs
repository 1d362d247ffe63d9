#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod analytics;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod providers;
pub mod ratelimit;
pub mod security;
pub mod vent;

pub use config::Config;

/// Version reported by `/` and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
