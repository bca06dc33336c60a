//! Connection pumps.
//!
//! Each live stream runs two loops: the inbound pump reads frames and
//! dispatches envelopes, the outbound pump drains the connection's queue onto
//! the stream and keeps it alive with pings. Whichever loop stops first closes
//! the connection handle, which stops the other; teardown runs once both have
//! returned.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use parley_core::{ConnectionHandle, Dispatcher, Identity};
use parley_protocol::{codec, Payload};
use parley_transport::{Frame, FrameSink, FrameSource, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Timing and size limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Close the connection when nothing is read for this long.
    pub idle_timeout: Duration,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Maximum time to write one frame.
    pub write_timeout: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_size: usize,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PumpConfig {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.heartbeat.timeout(),
            heartbeat_interval: config.heartbeat.interval(),
            write_timeout: config.heartbeat.write_timeout(),
            max_frame_size: config.limits.max_message_size,
            queue_capacity: config.limits.outbound_queue_capacity,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The handle was closed elsewhere (eviction or the other pump).
    Closed,
    /// The peer closed the stream.
    PeerClosed,
    /// Nothing was read within the idle timeout.
    IdleTimeout,
    /// An inbound frame exceeded the size limit.
    FrameTooLarge,
    /// A read failed.
    ReadError,
    /// A write failed or timed out.
    WriteError,
    /// The outbound queue was closed.
    QueueClosed,
}

/// Serve one authenticated connection until it closes.
///
/// Registers the connection (evicting any previous one of the same user),
/// runs both pumps and tears the connection down.
pub async fn serve<Snk, Src>(
    dispatcher: Arc<Dispatcher>,
    identity: Identity,
    sink: Snk,
    source: Src,
    config: PumpConfig,
) where
    Snk: FrameSink,
    Src: FrameSource,
{
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (handle, rx) = dispatcher.connect(identity, config.queue_capacity);
    debug!(
        connection = %handle.id(),
        user_id = handle.user_id(),
        "Connection established"
    );

    let (inbound, outbound) = tokio::join!(
        inbound_pump(&dispatcher, &handle, source, &config),
        outbound_pump(&handle, rx, sink, &config),
    );

    dispatcher.disconnect(&handle);
    metrics::set_active_rooms(dispatcher.rooms().room_count());
    debug!(
        connection = %handle.id(),
        user_id = handle.user_id(),
        inbound = ?inbound,
        outbound = ?outbound,
        dropped = handle.dropped_count(),
        "Connection closed"
    );
}

/// Read frames and dispatch envelopes in arrival order.
async fn inbound_pump<Src: FrameSource>(
    dispatcher: &Dispatcher,
    handle: &ConnectionHandle,
    mut source: Src,
    config: &PumpConfig,
) -> Shutdown {
    let shutdown = loop {
        let read = tokio::select! {
            biased;
            () = handle.closed() => break Shutdown::Closed,
            read = time::timeout(config.idle_timeout, source.recv()) => read,
        };

        let frame = match read {
            Err(_) => {
                debug!(connection = %handle.id(), "Idle timeout");
                break Shutdown::IdleTimeout;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break Shutdown::PeerClosed,
            Ok(Err(e)) => {
                debug!(connection = %handle.id(), error = %e, "Read failed");
                metrics::record_error("read");
                break Shutdown::ReadError;
            }
        };

        let data = match &frame {
            Frame::Text(payload) => payload.as_bytes(),
            Frame::Binary(data) => &data[..],
            // Heartbeats only reset the idle timeout.
            Frame::Ping(_) | Frame::Pong(_) => continue,
        };
        if data.len() > config.max_frame_size {
            warn!(
                connection = %handle.id(),
                size = data.len(),
                max = config.max_frame_size,
                "Inbound frame too large"
            );
            break Shutdown::FrameTooLarge;
        }

        let envelope = match codec::decode_with_limit(data, config.max_frame_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(connection = %handle.id(), error = %e, "Malformed envelope ignored");
                metrics::record_dropped("malformed", 1);
                continue;
            }
        };

        let kind = envelope.kind();
        metrics::record_envelope(kind, data.len(), "inbound");
        let start = Instant::now();
        let dispatched = dispatcher.dispatch(handle, envelope).await;
        metrics::record_latency(start.elapsed().as_secs_f64());
        metrics::record_dispatched(&dispatched);
        if kind.is_signal() {
            metrics::set_active_rooms(dispatcher.rooms().room_count());
        }
    };

    handle.close();
    shutdown
}

/// Write queued payloads and heartbeats until the connection closes.
async fn outbound_pump<Snk: FrameSink>(
    handle: &ConnectionHandle,
    mut rx: mpsc::Receiver<Payload>,
    mut sink: Snk,
    config: &PumpConfig,
) -> Shutdown {
    let mut ticker = time::interval_at(
        time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut wrote_since_tick = false;

    let shutdown = loop {
        tokio::select! {
            biased;
            () = handle.closed() => break Shutdown::Closed,
            payload = rx.recv() => {
                let Some(payload) = payload else {
                    break Shutdown::QueueClosed;
                };
                let size = payload.len();
                if let Err(e) = write(&mut sink, Frame::Text(payload), config.write_timeout).await {
                    debug!(connection = %handle.id(), error = %e, "Write failed");
                    metrics::record_error("write");
                    break Shutdown::WriteError;
                }
                metrics::record_outbound(size);
                wrote_since_tick = true;
            }
            _ = ticker.tick() => {
                if wrote_since_tick {
                    wrote_since_tick = false;
                    continue;
                }
                trace!(connection = %handle.id(), "Sending ping");
                if let Err(e) = write(&mut sink, Frame::ping(), config.write_timeout).await {
                    debug!(connection = %handle.id(), error = %e, "Ping failed");
                    break Shutdown::WriteError;
                }
            }
        }
    };

    handle.close();
    if let Err(e) = sink.close().await {
        trace!(connection = %handle.id(), error = %e, "Close failed");
    }
    shutdown
}

async fn write<Snk: FrameSink>(
    sink: &mut Snk,
    frame: Frame,
    limit: Duration,
) -> Result<(), TransportError> {
    match time::timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}
