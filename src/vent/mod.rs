//! The vent pipeline pieces: request validation, PII scrubbing, prompt
//! assembly and the relay from provider events to client frames.

pub mod models;
pub mod prompt;
pub mod relay;

pub use models::{ScrubbedVent, Vent, VentMode, VentRequest, VentValidationError};
pub use prompt::{build_chat_request, build_context, SYSTEM_PROMPT};
pub use relay::{relay_frames, Outcome, RelayFrame, RelaySummary};
