pub mod config;
pub mod error;
pub mod instructions;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod session;
pub mod state;
pub mod surface;
pub mod tmux;
pub mod util;

pub use error::{Error, Result};
pub use session::{RunId, Session, SessionId, SessionState};
