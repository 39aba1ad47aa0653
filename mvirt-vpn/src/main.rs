//! mvirt-vpn daemon
//!
//! Brings up a TUN device and runs the packet pump against it, with a
//! loopback handler standing in for the userspace TCP/UDP stacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use mvirt_vpn::config::{DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_INTERVAL, DEFAULT_IO_TIMEOUT};
use mvirt_vpn::tun::{DEFAULT_TUN_NAME, TunDevice};
use mvirt_vpn::{BufferPool, InboundQueue, PacketPump, PumpConfig, TcpQueue, UdpQueue, spawn};

#[derive(Parser)]
#[command(name = "mvirt-vpn")]
#[command(about = "mvirt local VPN packet pump")]
struct Args {
    /// TUN device name
    #[arg(short, long, default_value = DEFAULT_TUN_NAME)]
    tun_name: String,

    /// Size of each pooled packet buffer in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Idle sleep between pump iterations without traffic (ms)
    #[arg(long, default_value_t = DEFAULT_IDLE_INTERVAL.as_millis() as u64)]
    idle_ms: u64,

    /// Upper bound for a single interface read while nothing is queued inbound (ms)
    #[arg(long, default_value_t = DEFAULT_IO_TIMEOUT.as_millis() as u64)]
    io_timeout_ms: u64,

    /// Write every outbound packet straight back to the device instead of
    /// dropping it
    #[arg(long)]
    echo: bool,
}

/// Stand-in protocol handler: drains the outbound queues.
struct LoopbackHandler {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl LoopbackHandler {
    fn spawn(
        pool: Arc<BufferPool>,
        udp_queue: Arc<UdpQueue>,
        tcp_queue: Arc<TcpQueue>,
        inbound_queue: Arc<InboundQueue>,
        echo: bool,
        idle: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("vpn-loopback".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    let mut busy = false;
                    while let Some(packet) = udp_queue.pop().or_else(|| tcp_queue.pop()) {
                        busy = true;
                        debug!(packet = %packet, "Outbound packet");
                        let mut buffer = packet.into_buffer();
                        if echo {
                            // Back to write mode with the packet bytes before position
                            let len = buffer.limit();
                            buffer.clear();
                            buffer.advance(len);
                            inbound_queue.push(buffer);
                        } else {
                            pool.release(Some(buffer));
                        }
                    }
                    if !busy {
                        thread::sleep(idle);
                    }
                }
            })?;

        Ok(LoopbackHandler {
            thread: Some(thread),
            shutdown,
        })
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Loopback handler panicked");
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_vpn=info".parse()?))
        .init();

    let args = Args::parse();

    let config = PumpConfig::new()
        .with_buffer_size(args.buffer_size)
        .with_idle_interval(Duration::from_millis(args.idle_ms))
        .with_io_timeout(Duration::from_millis(args.io_timeout_ms));
    config.validate()?;

    info!(tun = %args.tun_name, echo = args.echo, "Initializing mvirt-vpn");

    let tun = TunDevice::create(&args.tun_name)
        .with_context(|| format!("Failed to create TUN device {}", args.tun_name))?;
    tun.bring_up().context("Failed to bring TUN device up")?;

    let pool = Arc::new(BufferPool::with_buffer_size(config.buffer_size));
    let udp_queue = Arc::new(UdpQueue::new());
    let tcp_queue = Arc::new(TcpQueue::new());
    let inbound_queue = Arc::new(InboundQueue::new());

    let handler = LoopbackHandler::spawn(
        Arc::clone(&pool),
        Arc::clone(&udp_queue),
        Arc::clone(&tcp_queue),
        Arc::clone(&inbound_queue),
        args.echo,
        config.idle_interval,
    )
    .context("Failed to spawn loopback handler")?;

    let pump = PacketPump::new(
        tun.into_interface(),
        Arc::clone(&pool),
        udp_queue,
        tcp_queue,
        inbound_queue,
        config,
    );
    let handle = spawn(pump).context("Failed to spawn packet pump")?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                if !handle.is_running() {
                    break;
                }
            }
        }
    }

    handle.stop();
    let stats = handle.stats();
    let reason = handle.join();
    handler.stop();

    info!(
        reason = %reason,
        packets_read = stats.packets_read,
        packets_written = stats.packets_written,
        unclassified = stats.unclassified,
        pool_allocations = pool.allocations(),
        "mvirt-vpn stopped"
    );

    if reason.is_cancelled() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("packet pump stopped: {reason}"))
    }
}
