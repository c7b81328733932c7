//! Prints what the negotiator would offer from this terminal.

use failure::Error;
use structopt::StructOpt;

use media::term;

#[derive(StructOpt)]
pub struct Opts {}

pub fn run(_opts: Opts) -> Result<(), Error> {
    let (cols, rows) = term::detect_size();
    println!("terminal: {}x{}", cols, rows);
    println!("capabilities, preferred first:");
    for cap in term::detect() {
        println!("  {}", cap);
    }
    Ok(())
}
