pub mod cherry_pick;
pub mod command;
pub mod error;
pub mod repo;
pub mod snapshot;
pub mod worktree;

pub use cherry_pick::*;
pub use command::*;
pub use error::*;
pub use repo::*;
pub use snapshot::*;
pub use worktree::*;
