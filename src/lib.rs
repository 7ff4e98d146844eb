pub mod calibration;
pub mod cli;
pub mod config;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod runner;
pub mod session;

pub use config::Config;
pub use error::{Result, SessionError};
pub use hooks::Collaborators;
pub use runner::{ProfilingEvent, ProfilingEventListener, TargetRunner};
pub use session::{AttachMode, ProfilerClient};
