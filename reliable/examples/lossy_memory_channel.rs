use reliable::channel::memory::{LinkImpairment, MemoryChannel, MemoryChannelConfig};
use reliable::config::ReliableConfig;
use reliable::connection::{Connection, ConnectionParams};
use reliable::piggyback::PiggybackRegistry;
use reliable::sweeper::Sweeper;
use std::sync::Arc;
use tracing::{info, Level};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        // .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

/// Two connection ends talking through an in-process channel that loses, duplicates and
///  reorders a fair share of all frames
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = ReliableConfig::default_lan();
    let sweeper = Sweeper::start(config.sweep_interval);

    let (channel_a, channel_b) = MemoryChannel::pair(MemoryChannelConfig {
        mtu: 200,
        header_offset: 0,
        capacity: 256,
        impairment: LinkImpairment {
            drop_probability: 0.2,
            duplicate_probability: 0.05,
            reorder_probability: 0.2,
        },
        seed: 4711,
    })?;

    let registry_a = Arc::new(PiggybackRegistry::new());
    let registry_b = Arc::new(PiggybackRegistry::new());
    let index_a = registry_a.allocate_index();
    let index_b = registry_b.allocate_index();

    let a = Connection::open(Arc::new(channel_a), &config, ConnectionParams {
        window_size: config.window_size,
        local_index: index_a,
        partner_index: index_b,
    }, registry_a, &sweeper).await?;
    let b = Connection::open(Arc::new(channel_b), &config, ConnectionParams {
        window_size: config.window_size,
        local_index: index_b,
        partner_index: index_a,
    }, registry_b, &sweeper).await?;

    let receiving = tokio::spawn(async move {
        for _ in 0..50 {
            let msg = b.receive_message().await?;
            info!("received {:?}", String::from_utf8_lossy(&msg));
        }
        let stats = b.stats().await;
        info!("receiver stats: {:?}", stats);
        Ok::<_, reliable::error::ReliableError>(b)
    });

    for i in 0..50 {
        a.send_message(format!("message #{} {}", i, "-".repeat(i * 7)).as_bytes()).await?;
    }
    let b = receiving.await??;

    a.close().await;
    b.close().await;

    let stats = a.stats().await;
    info!("sender stats: {:?}", stats);
    Ok(())
}
