pub mod command;
pub mod discover;
pub mod error;
pub mod runner;
pub mod tiers;

pub use command::*;
pub use discover::*;
pub use error::*;
pub use runner::*;
pub use tiers::*;
