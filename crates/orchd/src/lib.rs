//! relay supervisor, submit manager and multi-track orchestrator.

pub mod collision;
pub mod context;
pub mod diagnostics;
pub mod event_log;
pub mod launcher;
pub mod logging;
pub mod orchestrator;
pub mod persistence;
// prompt_builder intentionally not glob-reexported to keep prompt helpers namespaced.
pub mod prompt_builder;
pub mod retry;
pub mod review_loop;
pub mod scope_guard;
pub mod state_machine;
pub mod submit;
pub mod supervisor;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use collision::*;
pub use context::*;
pub use diagnostics::*;
pub use event_log::*;
pub use launcher::*;
pub use orchestrator::*;
pub use persistence::*;
pub use retry::*;
pub use review_loop::*;
pub use scope_guard::*;
pub use state_machine::*;
pub use submit::*;
pub use supervisor::*;
pub use workspace::*;
