//! Background daemon: the Unix-socket control protocol, the live gaze
//! pipeline and the hand-off of finished summaries.

pub(crate) mod dispatch;
mod pipeline;
pub mod runtime;
mod server;

pub use server::{client_request, run_daemon};
