use portgate::Protocol;

pub mod tunnel;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Expose a local HTTP server (WebSocket upgrades included)
    Http(tunnel::Args),

    /// Expose a local HTTP server behind an HTTPS public URL
    Https(tunnel::Args),

    /// Expose a raw TCP service
    Tcp(tunnel::Args),
}

impl Command {
    pub fn tunnel(&self) -> (Protocol, &tunnel::Args) {
        match self {
            Command::Http(args) => (Protocol::Http, args),
            Command::Https(args) => (Protocol::Https, args),
            Command::Tcp(args) => (Protocol::Tcp, args),
        }
    }
}
