//! ascii-chat command-line front end.

mod capture;
mod connect;
mod hosts;
mod identity;
mod net;
mod probe;
mod serve;

use failure::Error;
use log::error;
use std::fmt::Write;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "ascii-chat", about = "peer-to-peer terminal video chat")]
enum Cmd {
    /// Accept one peer and stream rendered video to it.
    Serve(serve::Opts),
    /// Connect to a peer and display its video.
    Connect(connect::Opts),
    /// Print the local terminal's detected capabilities.
    Probe(probe::Opts),
    /// Manage pinned host keys.
    Hosts(hosts::Opts),
}

/// Returns a pretty-and-informative version of `e`.
pub fn prettify_failure(e: &failure::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    if e.backtrace().is_empty() {
        write!(
            &mut msg,
            "\n\n(set environment variable RUST_BACKTRACE=1 to see backtraces)"
        )
        .unwrap();
    } else {
        write!(&mut msg, "\n\nBacktrace:\n{}", e.backtrace()).unwrap();
    }
    msg
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("ASCII_CHAT_LOG", "info"))
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = main_inner().await {
        error!("Fatal: {}", prettify_failure(&e));
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    match Cmd::from_args() {
        Cmd::Serve(opts) => serve::run(opts).await,
        Cmd::Connect(opts) => connect::run(opts).await,
        Cmd::Probe(opts) => probe::run(opts),
        Cmd::Hosts(opts) => hosts::run(opts),
    }
}
