use std::net;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time;

use clap::Parser;

/// Connects to the router as a bus participant, optionally sends one message, and prints every
/// message received.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Id to announce to the router (nonzero)
    #[arg(long)]
    id: vbus::NodeId,

    /// Router address
    #[arg(long, default_value_t = net::SocketAddrV4::new(net::Ipv4Addr::LOCALHOST, vbus::ROUTER_PORT_DEFAULT))]
    router: net::SocketAddrV4,

    /// Destination of the message
    #[arg(long, conflicts_with = "broadcast")]
    dest: Option<vbus::NodeId>,

    /// Send the message to every other node
    #[arg(long)]
    broadcast: bool,

    /// Message to send
    #[arg(long)]
    message: Option<String>,

    /// How long to keep listening, in milliseconds
    #[arg(long, default_value_t = 1000)]
    listen_ms: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = vbus::client::Config {
        router_addr: args.router,
    };

    let node = vbus::Node::connect(
        args.id,
        config,
        Arc::new(vbus::socket::OsSockets),
        |src, data| {
            println!("{} -> {}", src, String::from_utf8_lossy(&data));
        },
    );

    let node = match node {
        Ok(node) => node,
        Err(err) => {
            log::error!("failed to connect: {}", err);
            process::exit(1);
        }
    };

    if let Some(message) = args.message {
        let result = match (args.dest, args.broadcast) {
            (_, true) => node.send_message(message.as_bytes(), 0, true),
            (Some(dest), false) => node.send_message(message.as_bytes(), dest, false),
            (None, false) => {
                log::error!("--message requires --dest or --broadcast");
                process::exit(2);
            }
        };

        if let Err(err) = result {
            log::error!("failed to send: {}", err);
        }
    }

    thread::sleep(time::Duration::from_millis(args.listen_ms));

    node.close();
}
