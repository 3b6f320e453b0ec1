use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand, builder::RangedU64ValueParser};

use crate::relay::{DEFAULT_CAPACITY, MAX_CAPACITY, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, rebroadcasting every chat message to all sessions.
    Relay(RelayArgs),
    /// Open a chat session in the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Frames buffered per session before a slow session starts dropping them.
    #[arg(
        long,
        default_value_t = DEFAULT_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_CAPACITY as u64)
    )]
    pub capacity: usize,
}

impl From<&RelayArgs> for RelayConfig {
    fn from(args: &RelayArgs) -> Self {
        Self {
            listen: args.listen,
            capacity: args.capacity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the relay.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = "ws://127.0.0.1:5000/ws")]
    pub server: String,

    /// Echo messages locally instead of connecting to a relay.
    #[arg(long)]
    pub mock: bool,

    /// Simulated round trip for `--mock`, in milliseconds.
    #[arg(long, default_value_t = 100, requires = "mock")]
    pub echo_delay_ms: u64,
}
