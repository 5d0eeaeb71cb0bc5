//! Command-line argument parsing.

use getopts::Options;

use crate::device::DeviceMode;

const DEFAULT_PORT: u16 = 55555;

#[derive(Debug, Clone)]
pub enum Role {
    Server,
    Client(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ifname: String,
    pub role: Role,
    pub port: u16,
    pub mode: DeviceMode,
    pub debug: bool,
}

pub enum Parsed {
    /// `-h` was given: print this usage text and exit 0.
    Help(String),
    Run(Config),
}

fn options() -> Options {
    let mut opts = Options::new();
    opts.optopt("i", "", "tunnel interface name", "IFNAME");
    opts.optflag("s", "", "run as the server side (accept a connection)");
    opts.optopt("c", "", "run as the client side, connecting to HOST", "HOST");
    opts.optopt("p", "", "carrier TCP port (default 55555)", "PORT");
    opts.optflag("a", "", "allocate a tap device instead of tun");
    opts.optflag("d", "", "enable verbose diagnostics");
    opts.optflag("h", "", "print this help text");
    opts
}

/// Parse `args` (including `args[0]`, the program name, used only for the
/// usage banner). An `-h` anywhere always wins and short-circuits the rest
/// of validation — it's the one case that exits 0.
pub fn parse(args: &[String]) -> Result<Parsed, String> {
    let opts = options();
    let matches = opts.parse(&args[1..]).map_err(|e| e.to_string())?;

    if matches.opt_present("h") {
        let brief = format!("Usage: {} -i <ifname> (-s | -c <host>) [options]", args[0]);
        return Ok(Parsed::Help(opts.usage(&brief)));
    }

    let ifname = matches.opt_str("i").ok_or("'-i <ifname>' is required")?;

    let role = match (matches.opt_present("s"), matches.opt_str("c")) {
        (true, None) => Role::Server,
        (false, Some(host)) => Role::Client(host),
        (true, Some(_)) => return Err("specify only one of -s or -c".to_string()),
        (false, None) => return Err("one of -s or -c is required".to_string()),
    };

    let mode = if matches.opt_present("a") {
        DeviceMode::Tap
    } else {
        DeviceMode::Tun
    };

    let port = match matches.opt_str("p") {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| format!("'-p {p}' is not a valid port number"))?,
        None => DEFAULT_PORT,
    };

    Ok(Parsed::Run(Config {
        ifname,
        role,
        port,
        mode,
        debug: matches.opt_present("d"),
    }))
}
