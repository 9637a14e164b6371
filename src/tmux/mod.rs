// ABOUTME: Host-based tmux session backend
// Narrow adapter over the tmux server plus an in-memory fake for tests

/// The backend trait.
pub mod backend;
/// Output capture arguments.
pub mod capture;
/// Backend error classification.
pub mod error;
/// In-memory backend, also served by `run --fake-backend`.
pub mod fake;
/// The tmux command-line backend.
pub mod session;

pub use backend::{SessionBackend, SessionHandle};
pub use error::BackendError;
pub use fake::FakeBackend;
pub use session::TmuxBackend;
