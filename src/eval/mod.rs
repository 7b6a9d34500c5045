//! Batch command-line front end (`judgeflow_eval`).

mod app;

pub use app::{main, run_app, Cli};
