mod actions;
mod calibration;
mod cli;
mod config;
mod engine;
mod error;
mod gestures;
mod ipc;
mod landmarks;
mod logging;
mod profile;
mod tracker;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
