//! qfetch utility - main entrypoint
// (c) 2024 Ross Younger

use std::process::ExitCode;

fn main() -> ExitCode {
    qfetch::main(std::env::args_os())
}
