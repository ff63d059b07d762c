use anyhow::{Result, bail};
use clap::Parser;
use rkm::cli::{Cli, Commands};
use rkm::config::load_master_config;
use rkm::publisher::read_published;
use rkm::supervisor::InstanceSupervisor;
use rkm::{logging, master};

// No runtime before the supervisor has daemonized; it builds its own.
fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Commands::Slave(args) => {
            let options = args.into_options()?;
            InstanceSupervisor::new(options).run(&mut std::io::stdout())
        }
        Commands::Master { config } => {
            let cfg = load_master_config(&config)?;
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(master::run(cfg))
        }
        Commands::Address { address_file } => match read_published(&address_file)? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            None => bail!("no address published at {}", address_file.display()),
        },
    }
}
