use std::io;
use std::process::ExitCode;

use dupacktun::cli::{self, Parsed, Role};
use dupacktun::diag::Diag;
use dupacktun::engine::Engine;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match cli::parse(&args) {
        Ok(Parsed::Help(usage)) => {
            println!("{usage}");
            ExitCode::SUCCESS
        }
        Ok(Parsed::Run(cfg)) => match run(cfg) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("dupacktun: {e}");
                ExitCode::FAILURE
            }
        },
        Err(msg) => {
            eprintln!("dupacktun: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: cli::Config) -> io::Result<()> {
    let diag = Diag::new(cfg.debug);
    let mut engine = Engine::from_config(&cfg, diag)?;
    diag.info(format_args!(
        "dupacktun: {} ready on {}",
        role_label(&cfg.role),
        cfg.ifname
    ));
    engine.run()
}

fn role_label(role: &Role) -> String {
    match role {
        Role::Server => "listening".to_string(),
        Role::Client(addr) => format!("connecting to {addr}"),
    }
}
