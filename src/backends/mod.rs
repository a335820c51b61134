//! Concrete provider backends.
//!
//! Every hosted LLM endpoint this crate talks to speaks the
//! OpenAI-compatible chat completions dialect, so one backend covers
//! OpenAI, Groq, OpenRouter, Ollama, and the rest of the ecosystem.

mod openai;

pub use openai::OpenAiCompatible;
