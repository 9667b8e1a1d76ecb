//! Session and streaming coordination core for an AI chat client.
//!
//! The crate owns the conversation transcript, the backend session and
//! context-cache lifecycle, and the reassembly of a fragmented streamed
//! response into one message record. The UI layer and the raw HTTP client
//! sit on either side of the seams exposed here.

pub mod config;
pub mod models;
pub mod providers;
pub mod services;
