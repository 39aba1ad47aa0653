//! VPN packet pump
//!
//! Single loop that moves raw IP packets between the virtual interface and
//! the protocol queues:
//! - read phase: one packet from the device, classified onto the UDP or TCP
//!   queue
//! - write phase: one buffer from the inbound queue, written back to the
//!   device
//! - idle: sleep for `idle_interval` when neither phase had work

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferPool};
use crate::config::{PumpConfig, validate_buffer_size};
use crate::error::{ExitReason, PumpError, is_fatal};
use crate::interface::{InterfaceReader, InterfaceWriter, VirtualInterface};
use crate::packet::Packet;
use crate::queue::{InboundQueue, TcpQueue, UdpQueue};

/// Pump thread name
pub const PUMP_THREAD_NAME: &str = "vpn-pump";

/// Counters updated by the pump, readable from any thread.
#[derive(Debug, Default)]
pub struct PumpStats {
    packets_read: AtomicU64,
    udp_routed: AtomicU64,
    tcp_routed: AtomicU64,
    unclassified: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    idle_sleeps: AtomicU64,
}

/// Point-in-time copy of [`PumpStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStatsSnapshot {
    pub packets_read: u64,
    pub udp_routed: u64,
    pub tcp_routed: u64,
    pub unclassified: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub idle_sleeps: u64,
}

impl PumpStats {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            udp_routed: self.udp_routed.load(Ordering::Relaxed),
            tcp_routed: self.tcp_routed.load(Ordering::Relaxed),
            unclassified: self.unclassified.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            idle_sleeps: self.idle_sleeps.load(Ordering::Relaxed),
        }
    }
}

/// Buffer carried between read phases.
///
/// A buffer stays `Pending` after a read that produced nothing, so the next
/// read reuses it instead of going back to the pool.
#[derive(Debug)]
enum ReadSlot {
    NeedBuffer,
    Pending(Buffer),
}

impl ReadSlot {
    fn take(&mut self) -> ReadSlot {
        std::mem::replace(self, ReadSlot::NeedBuffer)
    }
}

/// Moves packets between a virtual interface and the protocol queues.
pub struct PacketPump<I: VirtualInterface> {
    interface: I,
    pool: Arc<BufferPool>,
    udp_queue: Arc<UdpQueue>,
    tcp_queue: Arc<TcpQueue>,
    inbound_queue: Arc<InboundQueue>,
    config: PumpConfig,
    stats: Arc<PumpStats>,
}

impl<I: VirtualInterface> PacketPump<I> {
    pub fn new(
        interface: I,
        pool: Arc<BufferPool>,
        udp_queue: Arc<UdpQueue>,
        tcp_queue: Arc<TcpQueue>,
        inbound_queue: Arc<InboundQueue>,
        config: PumpConfig,
    ) -> Self {
        PacketPump {
            interface,
            pool,
            udp_queue,
            tcp_queue,
            inbound_queue,
            config,
            stats: Arc::new(PumpStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `cancel` is set or the interface fails.
    ///
    /// The interface channels are opened once and closed when this returns.
    pub fn run(mut self, cancel: &AtomicBool) -> ExitReason {
        // Reads land in pool buffers, so the pool's size is the one that counts
        let checked = self
            .config
            .validate()
            .and_then(|()| validate_buffer_size(self.pool.buffer_size()));
        if let Err(e) = checked {
            error!(error = %e, "Refusing to start packet pump");
            return ExitReason::Fatal(e);
        }

        let (mut reader, mut writer) = match self.interface.open_channels() {
            Ok(channels) => channels,
            Err(e) => {
                error!(error = %e, "Failed to open interface channels");
                return ExitReason::Fatal(PumpError::OpenChannels(e));
            }
        };

        info!(
            buffer_size = self.pool.buffer_size(),
            io_timeout_ms = self.config.io_timeout.as_millis() as u64,
            idle_ms = self.config.idle_interval.as_millis() as u64,
            "Packet pump started"
        );

        let mut slot = ReadSlot::NeedBuffer;
        let reason = loop {
            if cancel.load(Ordering::Relaxed) {
                break ExitReason::Cancelled;
            }

            let data_sent = match self.read_phase(&mut reader, &mut slot) {
                Ok(active) => active,
                Err(e) => break ExitReason::Fatal(e),
            };
            let data_received = match self.write_phase(&mut writer) {
                Ok(active) => active,
                Err(e) => break ExitReason::Fatal(e),
            };

            if !data_sent && !data_received {
                PumpStats::bump(&self.stats.idle_sleeps);
                thread::sleep(self.config.idle_interval);
            }
        };

        if let ReadSlot::Pending(buffer) = slot {
            self.pool.release(Some(buffer));
        }
        drop(reader);
        drop(writer);

        match &reason {
            ExitReason::Cancelled => info!("Packet pump stopped"),
            ExitReason::Fatal(e) => error!(error = %e, "Packet pump failed"),
        }
        reason
    }

    /// Read at most one packet and route it.
    ///
    /// Returns whether a packet was handed to a protocol queue.
    fn read_phase<R: InterfaceReader>(
        &self,
        reader: &mut R,
        slot: &mut ReadSlot,
    ) -> Result<bool, PumpError> {
        let mut buffer = match slot.take() {
            ReadSlot::Pending(mut buffer) => {
                buffer.clear();
                buffer
            }
            ReadSlot::NeedBuffer => self.pool.acquire(),
        };

        // Inbound work is waiting: only take what the device already has
        let timeout = if self.inbound_queue.is_empty() {
            self.config.io_timeout
        } else {
            Duration::ZERO
        };

        let n = match reader.read_packet(buffer.write_area(), timeout) {
            Ok(0) => {
                *slot = ReadSlot::Pending(buffer);
                return Ok(false);
            }
            Ok(n) => n,
            Err(e) if is_fatal(&e) => {
                self.pool.release(Some(buffer));
                return Err(PumpError::Read(e));
            }
            Err(e) => {
                PumpStats::bump(&self.stats.read_errors);
                warn!(error = %e, "Interface read failed, retrying");
                *slot = ReadSlot::Pending(buffer);
                return Ok(false);
            }
        };

        PumpStats::bump(&self.stats.packets_read);
        buffer.advance(n);
        buffer.flip();

        match Packet::parse(buffer) {
            Ok(packet) if packet.is_udp() => {
                PumpStats::bump(&self.stats.udp_routed);
                self.udp_queue.push(packet);
                Ok(true)
            }
            Ok(packet) if packet.is_tcp() => {
                PumpStats::bump(&self.stats.tcp_routed);
                self.tcp_queue.push(packet);
                Ok(true)
            }
            Ok(packet) => {
                PumpStats::bump(&self.stats.unclassified);
                debug!(protocol = %packet.protocol(), len = n, "Dropping unclassified packet");
                self.pool.release(Some(packet.into_buffer()));
                Ok(false)
            }
            Err(rejected) => {
                PumpStats::bump(&self.stats.unclassified);
                debug!(error = %rejected.error, len = n, "Dropping unparsable packet");
                self.pool.release(Some(rejected.buffer));
                Ok(false)
            }
        }
    }

    /// Write at most one inbound buffer to the interface.
    ///
    /// Returns whether a buffer was written.
    fn write_phase<W: InterfaceWriter>(&self, writer: &mut W) -> Result<bool, PumpError> {
        let Some(mut buffer) = self.inbound_queue.pop() else {
            return Ok(false);
        };

        buffer.flip();
        let len = buffer.remaining();
        let result = write_all(writer, &mut buffer);
        self.pool.release(Some(buffer));

        match result {
            Ok(()) => {
                PumpStats::bump(&self.stats.packets_written);
                self.stats
                    .bytes_written
                    .fetch_add(len as u64, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if is_fatal(&e) => Err(PumpError::Write(e)),
            Err(e) => {
                PumpStats::bump(&self.stats.write_errors);
                warn!(error = %e, len, "Interface write failed, dropping packet");
                Ok(false)
            }
        }
    }
}

/// Write the readable bytes of `buffer`, retrying short writes.
fn write_all<W: InterfaceWriter>(writer: &mut W, buffer: &mut Buffer) -> io::Result<()> {
    while buffer.has_remaining() {
        match writer.write_packet(buffer.data()) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buffer.advance(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Handle to a pump running on its own thread
pub struct PumpHandle {
    thread: Option<JoinHandle<ExitReason>>,
    cancel: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
}

impl PumpHandle {
    /// Signal the pump to stop
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Check if the pump is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the pump to exit
    ///
    /// Does not stop the pump; call [`stop`](Self::stop) first for a clean
    /// shutdown.
    pub fn join(mut self) -> ExitReason {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(ExitReason::Fatal(PumpError::Panicked)),
            None => ExitReason::Cancelled,
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `pump` on a dedicated thread
pub fn spawn<I>(pump: PacketPump<I>) -> io::Result<PumpHandle>
where
    I: VirtualInterface + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = Arc::clone(&cancel);
    let stats = pump.stats();

    let thread = thread::Builder::new()
        .name(PUMP_THREAD_NAME.to_string())
        .spawn(move || pump.run(&cancel_clone))?;

    Ok(PumpHandle {
        thread: Some(thread),
        cancel,
        stats,
    })
}
