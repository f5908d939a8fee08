//! Worker connection example.
//!
//! Registers one function with a worker and keeps its connections to the
//! given job servers alive, logging every transition.
//!
//! Run with: RUST_LOG=debug cargo run --example tcp_worker -- 127.0.0.1:4730
//! Start a job server (for example `gearmand`) on that address first.

use bytes::Bytes;
use gearman_pool::{ThreadScheduler, TcpTransport, Worker, WorkerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER: &str = "127.0.0.1:4730";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let servers: Vec<SocketAddr> = match std::env::args().skip(1).collect::<Vec<_>>() {
        args if args.is_empty() => vec![DEFAULT_SERVER.parse()?],
        args => args
            .iter()
            .map(|arg| arg.parse::<SocketAddr>())
            .collect::<Result<_, _>>()?,
    };

    let worker = Worker::new(
        WorkerConfig::default().with_heartbeat_period(Duration::from_secs(5)),
        Arc::new(TcpTransport::default()),
        Arc::new(ThreadScheduler::new()?),
    );
    worker.set_client_id("tcp-worker-demo")?;
    worker.set_reconnect_period(Duration::from_secs(3))?;

    for server in &servers {
        worker.add_server(*server)?;
    }

    worker.add_function("reverse", |payload: &[u8]| -> Bytes {
        payload.iter().rev().copied().collect::<Vec<u8>>().into()
    })?;
    println!("Registered: {:?}", worker.registered_functions());

    for _ in 0..12 {
        thread::sleep(Duration::from_secs(5));
        for controller in worker.controllers() {
            let stats = controller.stats();
            println!(
                "{}: {} (connects={}, failures={}, disconnects={})",
                controller.key(),
                controller.state(),
                stats.connect_count,
                stats.failure_count,
                stats.disconnect_count
            );
        }
    }

    worker.remove_function("reverse");
    worker.shutdown();
    println!("Worker shut down");
    Ok(())
}
