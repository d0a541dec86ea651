// A TFTP server compliant with RFC 1350.
//
// Transfers run in lock step: the file moves in 512-byte DATA blocks, each
// of which must be acknowledged before the next is sent, and a block
// shorter than 512 bytes marks the end. The side holding the data keeps
// the last packet around for retransmission, pacing itself with an
// adaptive timeout learned from observed round trips. Errors are signalled
// with an unacknowledged, never-retransmitted error packet; the only
// non-fatal one answers packets arriving from the wrong source port.
//
// This server keeps its listening port as its transfer identifier instead
// of moving each transaction to an ephemeral port, so it serves exactly
// one client at a time and the dispatcher blocks until the transaction is
// over. Files come from and go to a directory subtree handed to the file
// store.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

pub mod netascii;
pub mod server;
pub mod store;
pub mod tftp;
pub mod timer;
pub mod transfer;

use server::TftpServer;
use store::DirStore;

/// Serve files over TFTP from a directory subtree.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// UDP port to listen on. The protocol default usually needs elevated
    /// privileges to bind.
    #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
    port: u16,

    /// Directory the file store serves from.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Enable diagnostic logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let mut server = TftpServer::bind(
        (Ipv4Addr::UNSPECIFIED, cli.port).into(),
        DirStore::new(cli.root),
    )?;
    log::info!("Listening on {}", server.local_addr()?);

    server.run().await;
    Ok(())
}
