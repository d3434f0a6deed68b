use std::path::PathBuf;

use clap::Parser;

/// Expose an HM-10 style BLE serial characteristic on a local TCP port.
#[derive(Debug, Default, Parser)]
#[command(name = "hmlink", version, about)]
pub struct Cli {
    /// GATT characteristic object path, e.g. /org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX/service0010/char0011
    #[arg(short = 'c', long = "char", value_name = "PATH")]
    pub characteristic: Option<String>,

    /// Device object path; must be the characteristic's device
    #[arg(short = 'd', long = "dev", value_name = "PATH")]
    pub device: Option<String>,

    /// Host to listen on [default: localhost]
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// TCP port to listen on [default: 3000]
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..=65534))]
    pub port: Option<u16>,

    /// Reconnect after a failed write instead of exiting
    #[arg(short = 'r', long)]
    pub reconnect: bool,

    /// Leave the peripheral connected on exit
    #[arg(short = 'k', long = "keep-ble-con")]
    pub keep_connected: bool,

    /// Config file to use instead of the default search path
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}
