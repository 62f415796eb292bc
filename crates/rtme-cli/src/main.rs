//! RTME runtime module tool
//!
//! Inspects and verifies `.rt` files, selects the best runtime for a
//! program, and loads modules through the module loader.

use clap::Parser;
use rtme_cli::args::{Capability, Command, RtmeCli};
use rtme_cli::commands::{inspect, load, select, verify};
use rtme_cli::logging;

fn main() -> anyhow::Result<()> {
    let cli = RtmeCli::parse();
    logging::init(cli.verbose);

    let mut stdout = std::io::stdout().lock();
    let result = match cli.command {
        Command::Inspect { file } => inspect::execute(&file, &mut stdout),
        Command::Verify { files } => verify::execute(&files, &mut stdout),
        Command::Select {
            dir,
            program,
            strategy,
            min_memory,
            max_footprint,
            needs,
            host,
            json,
        } => {
            let request = select::SelectRequest {
                program,
                strategy,
                min_memory,
                max_footprint,
                needs: Capability::collect(&needs),
                host_only: host,
                json,
            };
            match select::execute(&dir, &request, &mut stdout) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    eprintln!("no suitable runtime");
                    std::process::exit(2);
                }
                Err(e) => Err(e),
            }
        }
        Command::Load {
            config,
            search_paths,
            modules,
            run,
        } => load::execute(
            config.as_deref(),
            &search_paths,
            &modules,
            run,
            cli.verbose,
            &mut stdout,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
