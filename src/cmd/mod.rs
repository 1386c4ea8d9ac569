//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run`            |
//! | `analyze` | `Analyze`        |
//! | `probe`   | `Probe`          |
//! | `config`  | `Config`         |

pub mod analyze;
pub mod config;
pub mod probe;
pub mod run;

pub use analyze::cmd_analyze;
pub use config::cmd_config;
pub use probe::cmd_probe;
pub use run::cmd_run;
