pub mod actions;
pub mod config;

use clap::{Arg, ArgMatches, Command};

/// Command line definition.
pub fn command() -> Command {
    Command::new("genibridge")
        .about("GENIbus master bridge: polls and controls pumps on an RS-485 bus")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Run the bridge with the devices in this configuration file (.toml or .json)")
                .value_name("FILE")
                .conflicts_with_all(["list-ports", "check-config"]),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port, overrides the one in the configuration")
                .value_name("PORT")
                .requires("config"),
        )
        .arg(
            Arg::new("cycles")
                .long("cycles")
                .help("Stop after this many cycles")
                .value_name("N")
                .value_parser(clap::value_parser!(u64))
                .requires("config"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output results in JSON format (one update per line while running)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-config")
                .long("check-config")
                .help("Validate a configuration file, print a summary and exit")
                .value_name("FILE")
                .conflicts_with("list-ports"),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}
