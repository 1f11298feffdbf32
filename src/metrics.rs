//! StatsD metrics for reconciliation runs.
//!
//! Sends over UDP when an address is configured, otherwise every metric is
//! dropped by a no-op sink.

use cadence::prelude::*;
use cadence::{BufferedUdpMetricSink, MetricSink, NopMetricSink, QueuingMetricSink, StatsdClient};
use std::net::UdpSocket;
use std::time::Duration;

const PREFIX: &str = "token_operator";

pub struct Metrics {
    client: StatsdClient,
}

impl Metrics {
    /// Build a UDP exporter for `addr` (`host:port`), or a no-op one.
    pub fn new(addr: Option<&str>) -> anyhow::Result<Self> {
        let Some(addr) = addr else {
            return Ok(Self::disabled());
        };

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let udp_sink = BufferedUdpMetricSink::from(addr, socket)?;
        Ok(Self::from_sink(QueuingMetricSink::from(udp_sink)))
    }

    pub fn disabled() -> Self {
        Self::from_sink(NopMetricSink)
    }

    pub fn from_sink<S>(sink: S) -> Self
    where
        S: MetricSink + Sync + Send + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            client: StatsdClient::from_sink(PREFIX, sink),
        }
    }

    /// Emit the outcome of one reconciliation.
    pub fn record(&self, action: &str, ok: bool, elapsed: Duration) {
        let result = if ok { "success" } else { "failure" };

        let _ = self
            .client
            .count_with_tags("reconcile", 1)
            .with_tag("action", action)
            .with_tag("result", result)
            .try_send();

        let _ = self
            .client
            .time_with_tags("reconcile.duration", elapsed.as_millis() as u64)
            .with_tag("action", action)
            .try_send();
    }
}
