pub mod analyzer;
pub mod bridge;
pub mod collectors;
pub mod config;
pub mod errors;
pub mod item;
pub mod organizer;
pub mod progress;
pub mod session;
pub mod stages;
pub mod transformer;
pub mod ui;

pub use errors::{AnalyzerError, BridgeError, SessionError, StageError};
pub use session::{SessionConfig, SessionController, SessionHandle, SessionStage, SessionState};
