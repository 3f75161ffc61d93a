pub mod config;
pub mod convergence;
pub mod driver;
pub mod errors;
pub mod lock;
pub mod resume;
pub mod runner;
pub mod state;
pub mod tier;
pub mod tracker;
pub mod ui;
pub mod util;
pub mod worktree;
