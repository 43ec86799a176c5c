use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments.
pub fn parse_args() -> ArgMatches {
    Command::new("mbbridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Modbus RTU to MQTT bridge daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("BASE")
                .help("Configuration file base name (.cfg is appended automatically)"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches()
}

/// Default configuration base name: the executable name, like `-c` had been
/// given with it.
pub fn default_config_base() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "mbbridge".to_string())
}
