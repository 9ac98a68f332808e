//! LLM inference engines
//!
//! The engine capability a session drives, and its backends.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod scripted;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{Engine, EngineError, EngineOutcome, EngineProfile, Finish, FragmentSink, StopSignal};
#[cfg(feature = "llama")]
pub use llama::{LlamaEngine, LoadedModelInfo};
pub use model::{inspect_model, ModelArtifact, ModelError, GGUF_MAGIC};
pub use scripted::{EngineProbe, ScriptedEngine};
pub use streaming::{GenerationReport, StreamEvent, Utf8Assembler};
