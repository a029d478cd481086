pub mod adapter;
pub mod error;
pub mod parse;
pub mod runner;
pub mod signal;
pub mod types;

pub use adapter::*;
pub use error::*;
pub use parse::*;
pub use runner::*;
pub use signal::*;
pub use types::*;
