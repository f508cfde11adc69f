//! mail-guard: scans a mailbox, classifies each message through a chain of
//! LLM analysis stages, and labels and archives the suspicious ones.

pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod operator;
pub mod pipeline;
pub mod session;
