//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled          |
//! |-----------|---------------------------|
//! | `run`     | `Run`, `Batch`            |
//! | `cancel`  | `Cancel`                  |
//! | `status`  | `Status`                  |
//! | `teams`   | `Teams`                   |
//! | `task`    | `Task`                    |
//! | `signal`  | `Signal`                  |
//! | `config`  | `Config`                  |
//!
//! Every command returns the process exit code.

pub mod cancel;
pub mod config;
pub mod run;
pub mod signal;
pub mod status;
pub mod task;
pub mod teams;

pub use cancel::cmd_cancel;
pub use config::cmd_config;
pub use run::{cmd_batch, cmd_run};
pub use signal::cmd_signal;
pub use status::cmd_status;
pub use task::cmd_task;
pub use teams::cmd_teams;
