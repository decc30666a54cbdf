//! Voiceloop - interruptible voice conversation pipeline
//!
//! The user speaks, speech becomes text, the text goes to a streaming
//! generation backend, and the reply is spoken sentence by sentence while it
//! is still arriving. Starting a new turn cuts off the reply in progress.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ final  ┌──────────────┐ request ┌──────────────┐
//! │   Capture    ├───────►│ Orchestrator ├────────►│   Backend    │
//! │  (engine)    │◄───────┤  (session)   │◄────────┤ (SSE stream) │
//! └──────────────┘ start/ └──────┬───────┘ chunks  └──────────────┘
//!                  abort         │ sentences
//!                         ┌──────▼───────┐
//!                         │  Synthesis   │
//!                         │  (renderer)  │
//!                         └──────────────┘
//! ```

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod segment;
pub mod synthesis;
pub mod transcript;
pub mod voice;

pub use backend::{GenerationBackend, GenerationRequest, HttpBackend, StreamChunk};
pub use capture::{CaptureErrorKind, CaptureEvent, CaptureService, RecognitionEngine};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, SessionEvent, SessionHandle, SessionState};
pub use synthesis::{SpeechRenderer, SynthesisQueue};
pub use transcript::{ConversationTurn, Role, Transcript};
