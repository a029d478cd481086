pub mod config;
pub mod events;
pub mod pattern;
pub mod state;
pub mod task;
pub mod types;
pub mod validation;

pub use config::*;
pub use events::*;
pub use pattern::*;
pub use state::*;
pub use task::*;
pub use types::*;
pub use validation::*;
