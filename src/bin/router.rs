use std::net;
use std::process;
use std::sync::Arc;

use clap::Parser;

/// Runs the bus router until interrupted.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Local address to listen on
    #[arg(long, default_value_t = net::Ipv4Addr::LOCALHOST)]
    bind: net::Ipv4Addr,

    /// Port to listen on
    #[arg(long, default_value_t = vbus::ROUTER_PORT_DEFAULT)]
    port: u16,

    /// Maximum number of connections waiting to be accepted
    #[arg(long, default_value_t = vbus::LISTEN_BACKLOG_DEFAULT)]
    backlog: u32,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = vbus::server::Config {
        bind_addr: args.bind,
        port: args.port,
        backlog: args.backlog,
    };

    vbus::manager::install_signal_handlers();

    let manager = match vbus::Manager::start(config, Arc::new(vbus::socket::OsSockets)) {
        Ok(manager) => manager,
        Err(err) => {
            log::error!("failed to start router: {}", err);
            process::exit(1);
        }
    };

    manager.run_until_signal();

    drop(manager);

    process::exit(0);
}
