//! Thin binary entry point: parse arguments, run the pipeline, map a
//! failure to a process exit code.

use clap::Parser;
use containerize::cli::{self, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = cli::run(args).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
