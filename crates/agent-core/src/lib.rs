//! Shared control core for an autonomous world character: conversation
//! history, command registry, execution engine, self-prompt loop, and the
//! background mode supervisor.
//!
//! The world connection, language model, translator, and persistence layers
//! are collaborators behind traits so multiple binaries (the runner, headless
//! experiments, etc.) can share the same core.

pub mod agent;
pub mod config;
pub mod llm;
pub mod store;
pub mod translate;
pub mod world;
