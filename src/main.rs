use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use rust_vio::config::NodeConfig;
use rust_vio::estimator::SimpleEstimator;
use rust_vio::io::ReplayDataset;
use rust_vio::loop_closure::BruteForceRecognizer;
use rust_vio::node::VioNode;
use rust_vio::output::TracingPublisher;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let dataset_path = args.next().unwrap_or_else(|| "data/replay".to_string());
    let config = match args.next() {
        Some(path) => NodeConfig::load(path)?,
        None => {
            warn!("no config given, running with defaults");
            NodeConfig::default()
        }
    };

    let dataset = ReplayDataset::load(&dataset_path, config.num_of_cam)?;
    info!(
        imu = dataset.imu.len(),
        frames = dataset.frames.len(),
        "loaded {dataset_path}"
    );

    let estimator = SimpleEstimator::new(config.window_size);
    let mut node = VioNode::spawn(
        config,
        Box::new(estimator),
        Box::new(BruteForceRecognizer::new()),
        Arc::new(TracingPublisher),
    )?;

    dataset.feed(&node);

    // Let the fusion worker drain what the replay just queued.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        let queues = node.core().queues.lock();
        if queues.features.is_empty() {
            break;
        }
        drop(queues);
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    node.shutdown();
    info!("replay finished");
    Ok(())
}
