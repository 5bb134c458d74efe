//! LocaLM Bridge Library
//!
//! Session manager between a chat front end and a local llama.cpp model:
//! load a GGUF model, prefill a prompt, then stream the reply one decode
//! step at a time.

pub mod inference;
pub mod prompt;
pub mod storage;
pub mod system;
pub mod types;
