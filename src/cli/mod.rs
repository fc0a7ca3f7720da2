pub mod args;

use clap::Parser;
pub use args::{Arguments, PairMode, Tool};

pub fn parse() -> Arguments {
    Arguments::parse()
}
