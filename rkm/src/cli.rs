use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use common::LogSinkTarget;

use crate::address::{BindAddress, check_log_sink};
use crate::config::{
    DEFAULT_ADDRESS_FILE, DEFAULT_LOCK_FILE, DEFAULT_LOG_DIR, DEFAULT_STORAGE_DIR, NodePaths,
};
use crate::logging::LogFormat;
use crate::supervisor::SlaveOptions;

#[derive(Parser, Debug)]
#[command(name = "rkm", version, about = "RK8s machine agent")]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent on this machine (one instance per machine)
    Slave(SlaveArgs),
    /// Assign roles to the machines listed in a config file
    Master {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the address record published by the running agent
    Address {
        #[arg(long, default_value = DEFAULT_ADDRESS_FILE)]
        address_file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct SlaveArgs {
    /// `if4:<iface>`, `if6:<iface>`, or a literal address
    #[arg(value_name = "BIND")]
    pub bind: BindAddress,

    /// Port used when BIND carries none; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Where to ship logs, `<address>/<name>`; must accept connections
    #[arg(long = "log", value_name = "ADDR/NAME", value_parser = check_log_sink)]
    pub log_sink: Option<LogSinkTarget>,

    /// Terminate a running instance and take its place
    #[arg(long)]
    pub restart: bool,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(long)]
    pub foreground: bool,

    #[arg(long, default_value = DEFAULT_LOCK_FILE)]
    pub lock_file: PathBuf,

    #[arg(long, default_value = DEFAULT_ADDRESS_FILE)]
    pub address_file: PathBuf,

    #[arg(long, default_value = DEFAULT_STORAGE_DIR)]
    pub storage_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,
}

impl SlaveArgs {
    /// Resolves the bind address; fails before any daemon state exists.
    pub fn into_options(self) -> Result<SlaveOptions> {
        let bind = self.bind.resolve(self.port)?;
        Ok(SlaveOptions {
            bind,
            log_sink: self.log_sink,
            restart: self.restart,
            foreground: self.foreground,
            paths: NodePaths {
                lock_file: self.lock_file,
                address_file: self.address_file,
                storage_dir: self.storage_dir,
                log_dir: self.log_dir,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::net::TcpListener;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn slave_defaults() {
        let cli = Cli::try_parse_from(["rkm", "slave", "127.0.0.1"]).unwrap();
        let Commands::Slave(args) = cli.command else {
            panic!("expected slave");
        };
        assert!(!args.restart);
        assert!(args.log_sink.is_none());
        let options = args.into_options().unwrap();
        assert_eq!(options.bind, "127.0.0.1:0".parse().unwrap());
        assert_eq!(options.paths, NodePaths::default());
    }

    #[test]
    fn slave_with_interface_and_log_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sink = format!("{}/node-7", listener.local_addr().unwrap());
        let cli = Cli::try_parse_from([
            "rkm", "slave", "if4:lo", "--port", "7000", "--log", &sink, "--restart",
        ])
        .unwrap();
        let Commands::Slave(args) = cli.command else {
            panic!("expected slave");
        };
        assert!(args.restart);
        assert_eq!(args.log_sink.as_ref().unwrap().name, "node-7");
        let options = args.into_options().unwrap();
        assert_eq!(options.bind, "127.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn unreachable_log_sink_is_rejected_at_parse_time() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = format!("127.0.0.1:{port}/node");
        assert!(Cli::try_parse_from(["rkm", "slave", "127.0.0.1", "--log", &sink]).is_err());
    }

    #[test]
    fn bad_bind_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["rkm", "slave", "if4:"]).is_err());
    }
}
