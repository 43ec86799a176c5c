use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;

use mbbridge::bridge::Bridge;
use mbbridge::cli;
use mbbridge::config::{config_file_name, Config};
use mbbridge::modbus::rtu::RtuTransport;
use mbbridge::mqtt::MqttLink;
use mbbridge::signal;

fn main() {
    let matches = cli::parse_args();
    let debug_enabled = matches.get_flag("debug");
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug_enabled { "debug" } else { "info" }),
    )
    .init();

    if let Err(err) = run(&matches) {
        log::error!("{err:#}");
        log::error!("exit with error");
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    // SIGTERM is only honored when started by init; from a shell it stays
    // available as a last-resort kill
    let running_as_daemon = unsafe { libc::getppid() } == 1;
    signal::install(running_as_daemon);

    log::info!(
        "mbbridge {} (pid {}, ppid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        unsafe { libc::getppid() }
    );

    let config_base = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(cli::default_config_base);
    let config_path = config_file_name(&config_base);
    let config = Config::load(&config_path)
        .with_context(|| format!("error reading config file <{config_path}>"))?;

    let mut mqtt = MqttLink::new(
        config.mqtt.broker.clone(),
        config.mqtt.port,
        config.mqtt.debug && !running_as_daemon,
    );
    mqtt.connect();

    let transport = RtuTransport::open(
        &config.modbusrtu.device,
        config.modbusrtu.baudrate,
        config.response_timeout(),
        config.modbusrtu.debuglevel,
    )
    .with_context(|| format!("opening modbus port {}", config.modbusrtu.device))?;
    log::info!(
        "modbus RTU opened on port {} at {} baud",
        config.modbusrtu.device,
        config.modbusrtu.baudrate
    );

    let mut bridge = Bridge::from_config(&config, Box::new(transport), mqtt)?;

    // let the serial line and broker connection settle
    std::thread::sleep(Duration::from_millis(100));

    bridge.run();
    bridge.shutdown();
    log::info!("exiting");
    Ok(())
}
