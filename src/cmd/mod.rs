//! CLI command implementations.
//!
//! | Module   | Commands handled  |
//! |----------|-------------------|
//! | `run`    | `Run`, `Stage`    |
//! | `config` | `Config`          |

pub mod config;
pub mod run;

pub use config::cmd_config;
pub use run::{cmd_run, cmd_stage};
