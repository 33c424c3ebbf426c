use apteryx_common::uri::DEFAULT_URI;
use apteryx_server::Server;
use clap::Parser;

/// apteryxd - in-memory hierarchical datastore daemon.
#[derive(Parser)]
#[command(name = "apteryxd", version)]
struct Args {
    /// Socket to listen on (unix://PATH or tcp://ADDR:PORT); repeatable.
    #[arg(short, long, default_value = DEFAULT_URI)]
    listen: Vec<String>,

    /// Worker threads executing store operations.
    #[arg(short, long, default_value_t = 8)]
    workers: usize,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let _server = Server::start(&args.listen, args.workers).await?;

    // State is volatile; the daemon runs until killed.
    std::future::pending::<()>().await;
    Ok(())
}
