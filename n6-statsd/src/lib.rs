//! StatsD metrics of the aggregator, sent through cadence.
//!
//! Metric names are declared as enums implementing one of [`CounterMetric`], [`GaugeMetric`] or
//! [`TimerMetric`], so a counter can never be reported as a timer. Values are emitted with the
//! [`metric!`] macro, which does nothing until [`init`] has configured a client.
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! n6_statsd::init(n6_statsd::MetricsConfig {
//!     prefix: "n6".to_owned(),
//!     host: "localhost:8125".to_owned(),
//!     default_tags: BTreeMap::new(),
//! })
//! .unwrap();
//! ```
//!
//! ```
//! use n6_statsd::{CounterMetric, metric};
//!
//! enum QueueCounters {
//!     Rejected,
//! }
//!
//! impl CounterMetric for QueueCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Rejected => "queue.rejected",
//!         }
//!     }
//! }
//!
//! metric!(counter(QueueCounters::Rejected) += 1, source = "abuse-ch.feodotracker");
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;

/// Number of metrics buffered for the sender thread before new ones are dropped.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// A statsd client together with the tags added to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    /// The underlying cadence client.
    pub statsd_client: StatsdClient,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Adds the default tags and sends the metric. Failures are logged.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }

        if let Err(error) = metric.try_send() {
            n6_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric",
            );
        }
    }
}

/// Settings of the metrics client, built from the `metrics` config section.
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prefix of all metric names.
    pub prefix: String,
    /// Host and port of the statsd server.
    pub host: String,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
}

/// Errors while setting up the metrics client.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The statsd host could not be resolved.
    #[error("could not resolve statsd host {host}")]
    Resolve {
        /// The configured host.
        host: String,
        /// The resolver error.
        #[source]
        source: io::Error,
    },
    /// The statsd host resolved to no address.
    #[error("no address found for statsd host {0}")]
    NoAddress(String),
    /// The local socket could not be set up.
    #[error("failed to set up the statsd socket")]
    Socket(#[source] io::Error),
    /// cadence rejected the sink.
    #[error("failed to set up the statsd sink")]
    Sink(#[source] cadence::MetricError),
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        METRICS_CLIENT.read().clone().into();
}

/// Traits used by [`metric!`].
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Installs `client` for all threads.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| cell.replace(METRICS_CLIENT.read().clone()));
}

/// Runs `f` with a client that records metrics on the current thread and returns them.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: Default::default(),
    };

    CURRENT_CLIENT.with(|cell| {
        let previous = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(previous);
    });

    rx.iter()
        .map(|metric| String::from_utf8_lossy(&metric).into_owned())
        .collect()
}

/// Removes the client again.
pub fn disable() {
    *METRICS_CLIENT.write() = None;
    CURRENT_CLIENT.with(|cell| cell.replace(None));
}

/// Starts reporting metrics to the configured statsd server over UDP.
pub fn init(config: MetricsConfig) -> Result<(), MetricsError> {
    let addr = config
        .host
        .to_socket_addrs()
        .map_err(|source| MetricsError::Resolve {
            host: config.host.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| MetricsError::NoAddress(config.host.clone()))?;
    n6_log::info!("reporting metrics to statsd at {addr}");

    let socket = UdpSocket::bind("0.0.0.0:0").map_err(MetricsError::Socket)?;
    socket.set_nonblocking(true).map_err(MetricsError::Socket)?;
    let udp_sink = BufferedUdpMetricSink::from(addr, socket).map_err(MetricsError::Sink)?;
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, queuing_sink),
        default_tags: config.default_tags,
    });

    Ok(())
}

/// Calls `f` with the client of the current thread, or returns the default without a client.
///
/// Prefer the [`metric!`] macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| match client.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// Name of a timing, reported in milliseconds.
pub trait TimerMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// Name of a counter.
pub trait CounterMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// Name of a gauge.
pub trait GaugeMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// Emits a counter increment, a gauge value or a timing, optionally with tags.
///
/// Counter increments of zero are not sent.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            0 => {}
            value => {
                $crate::with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                            $(.with_tag(stringify!($($k).*), $v))*
                    )
                })
            }
        };
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                // cadence would send a `Duration` as nanoseconds.
                client.distribution_with_tags(
                    &$crate::TimerMetric::name(&$id),
                    $value.as_nanos() as f64 / 1e6,
                )
                $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };
}
