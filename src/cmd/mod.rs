//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Command handled                          |
//! |----------|-------------------------------------------|
//! | `run`    | `Run` (new runs and both resume forms)   |
//! | `status` | `Status`                                 |
//! | `reset`  | `Reset`                                  |

pub mod reset;
pub mod run;
pub mod status;

pub use reset::cmd_reset;
pub use run::cmd_run;
pub use status::cmd_status;
