//! Build an RT module from ASTC bytecode or raw machine code.

use clap::Parser;
use rtme_cli::args::BuilderArgs;
use rtme_cli::{build, logging};

fn main() -> anyhow::Result<()> {
    let args = BuilderArgs::parse();
    logging::init(args.verbose);

    let result = args
        .options()
        .and_then(|options| build::build_file(&args.input, &args.output, &options));
    match result {
        Ok(built) => {
            println!(
                "{} -> {} ({}, {} code bytes{})",
                args.input.display(),
                args.output.display(),
                built.header.target(),
                built.code.len(),
                if built.from_astc { ", compiled from ASTC" } else { "" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
