use reliable::channel::udp::UdpFrameChannel;
use reliable::config::ReliableConfig;
use reliable::connection::{Connection, ConnectionParams};
use reliable::piggyback::PiggybackRegistry;
use reliable::sweeper::Sweeper;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, span, Instrument, Level};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let addr_a = SocketAddr::from_str("127.0.0.1:9200")?;
    let addr_b = SocketAddr::from_str("127.0.0.1:9201")?;

    let config = ReliableConfig::default_lan();
    let sweeper = Sweeper::start(config.sweep_interval);

    // this would normally be the result of a handshake
    let registry = Arc::new(PiggybackRegistry::new());
    let index_a = registry.allocate_index();
    let index_b = registry.allocate_index();

    let a = Connection::open(
        Arc::new(UdpFrameChannel::connect(addr_a, addr_b, 1400).await?),
        &config,
        ConnectionParams { window_size: config.window_size, local_index: index_a, partner_index: index_b },
        registry.clone(),
        &sweeper,
    ).await?;
    let b = Connection::open(
        Arc::new(UdpFrameChannel::connect(addr_b, addr_a, 1400).await?),
        &config,
        ConnectionParams { window_size: config.window_size, local_index: index_b, partner_index: index_a },
        registry,
        &sweeper,
    ).await?;

    let ponging = tokio::spawn(async move {
        for _ in 0..10 {
            let ping = b.receive_message().await?;
            b.send_message(&ping).await?;
        }
        Ok::<_, reliable::error::ReliableError>(b)
    }.instrument(span!(Level::INFO, "pong")));

    for i in 0..10 {
        a.send_message(format!("ping {}", i).as_bytes()).await?;
        let pong = a.receive_message().await?;
        info!("got {:?} back", String::from_utf8_lossy(&pong));
    }
    let b = ponging.await??;

    info!("stats: {:?}", a.stats().await);
    a.close().await;
    b.close().await;
    Ok(())
}
