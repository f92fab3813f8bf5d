pub mod cli;
pub mod error;
pub mod fs;
pub mod git;
pub mod import;
pub mod lookaside;
pub mod patch_config;
pub mod patch_engine;
pub mod repo;
pub mod rpm;
pub mod tag;
pub mod worktree;

pub use cli::run;
