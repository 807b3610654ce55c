pub mod dispatch;
pub mod pipeline;
pub mod runtime;
pub mod server;
pub mod source;

pub use server::{client_request, client_watch, doctor_report, run_daemon};
