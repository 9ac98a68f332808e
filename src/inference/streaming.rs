//! Streaming inference support
//!
//! Events a backend worker emits while generating, and reassembly of raw
//! token bytes into text fragments.

use crate::inference::engine::Finish;

/// Event emitted by a backend worker during one generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded text fragment
    Fragment(String),
    /// Generation ended without error
    Finished(GenerationReport),
    /// Generation failed mid-stream
    Failed(String),
}

impl StreamEvent {
    /// Returns true if this event ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment(_))
    }

    /// Extracts the fragment text if this is a Fragment variant
    pub fn as_fragment(&self) -> Option<&str> {
        match self {
            StreamEvent::Fragment(s) => Some(s),
            _ => None,
        }
    }
}

/// Counters a worker reports when a generation ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationReport {
    pub finish: Finish,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub prompt_eval_ms: f64,
    pub generation_ms: f64,
}

/// Accumulates token bytes and releases the longest valid UTF-8 prefix.
///
/// A character split across several tokens is held back until its last
/// byte arrives. Bytes that can never form valid UTF-8 are replaced with
/// U+FFFD instead of stalling the stream.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds token bytes; returns text that is now complete, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix decodes
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete trailing sequence, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        (!out.is_empty()).then_some(out)
    }

    /// Flushes whatever is still buffered at the end of a generation.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Returns true if bytes are waiting for the rest of a character
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
