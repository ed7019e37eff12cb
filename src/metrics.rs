use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, Metric, QueuingMetricSink, StatsdClient,
    Timed,
};
use std::net::UdpSocket;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::MetricsConfig;
use crate::errors::MetricsError;

/// Trait for publishing metrics with counter, gauge, and timing support.
/// Designed for minimal compatibility with cadence-style metrics.
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1
    async fn incr(&self, key: &str);

    /// Increment a counter by 1 with tags
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    /// Increment a counter by a specific value
    async fn count(&self, key: &str, value: u64);

    /// Record a gauge value
    async fn gauge(&self, key: &str, value: u64);

    /// Record a timing in milliseconds
    async fn time(&self, key: &str, millis: u64);
}

/// No-op implementation for development and testing
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn time(&self, _key: &str, _millis: u64) {}
}

/// Statsd-backed metrics publisher using cadence
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl StatsdMetricsPublisher {
    pub fn new(
        host: &str,
        prefix: &str,
        bind_addr: &str,
        default_tags: Vec<(String, String)>,
    ) -> Result<Self, MetricsError> {
        let socket =
            UdpSocket::bind(bind_addr).map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;

        let buffered_sink = BufferedUdpMetricSink::from(host, socket)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        let queuing_sink = QueuingMetricSink::builder()
            .with_error_handler(move |error| {
                error!("Failed to send metric via sink: {}", error);
            })
            .build(buffered_sink);
        let client = StatsdClient::from_sink(prefix, queuing_sink);

        debug!(host, prefix, bind = bind_addr, "StatsdMetricsPublisher created");
        Ok(Self {
            client,
            default_tags,
        })
    }

    fn apply_default_tags<'a, M>(
        &'a self,
        mut builder: cadence::MetricBuilder<'a, 'a, M>,
    ) -> cadence::MetricBuilder<'a, 'a, M>
    where
        M: Metric + From<String>,
    {
        for (k, v) in &self.default_tags {
            builder = builder.with_tag(k.as_str(), v.as_str());
        }
        builder
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        if self.default_tags.is_empty() {
            if let Err(e) = self.client.incr(key) {
                error!("Failed to send metric {}: {}", key, e);
            }
        } else {
            let builder = self.apply_default_tags(self.client.incr_with_tags(key));
            let _ = builder.send();
        }
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        let mut builder = self.apply_default_tags(self.client.incr_with_tags(key));
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn count(&self, key: &str, value: u64) {
        if self.default_tags.is_empty() {
            let _ = self.client.count(key, value);
        } else {
            let builder = self.apply_default_tags(self.client.count_with_tags(key, value));
            let _ = builder.send();
        }
    }

    async fn gauge(&self, key: &str, value: u64) {
        if self.default_tags.is_empty() {
            if let Err(e) = self.client.gauge(key, value) {
                error!("Failed to send gauge {} = {}: {}", key, value, e);
            }
        } else {
            let builder = self.apply_default_tags(self.client.gauge_with_tags(key, value));
            let _ = builder.send();
        }
    }

    async fn time(&self, key: &str, millis: u64) {
        if self.default_tags.is_empty() {
            let _ = self.client.time(key, millis);
        } else {
            let builder = self.apply_default_tags(self.client.time_with_tags(key, millis));
            let _ = builder.send();
        }
    }
}

/// Type alias for shared metrics publisher
pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

/// Create a metrics publisher based on configuration.
///
/// Returns either a no-op publisher or a StatsD publisher depending on the
/// configured adapter.
pub fn create_metrics_publisher(
    config: &MetricsConfig,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match config.adapter.as_str() {
        "noop" | "" => Ok(Arc::new(NoOpMetricsPublisher::new())),
        "statsd" => {
            let host = config.statsd_host.as_deref().ok_or_else(|| {
                MetricsError::InvalidConfig(
                    "METRICS_STATSD_HOST is required when using statsd adapter".to_string(),
                )
            })?;

            // Parse tags from comma-separated key:value pairs
            let default_tags = if let Some(tags_str) = &config.tags {
                tags_str
                    .split(',')
                    .filter_map(|tag| {
                        let parts: Vec<&str> = tag.trim().split(':').collect();
                        if parts.len() == 2 {
                            Some((parts[0].to_string(), parts[1].to_string()))
                        } else {
                            error!("Invalid tag format: {}", tag);
                            None
                        }
                    })
                    .collect()
            } else {
                vec![]
            };

            let publisher = StatsdMetricsPublisher::new(
                host,
                &config.prefix,
                &config.statsd_bind,
                default_tags,
            )?;

            Ok(Arc::new(publisher))
        }
        other => Err(MetricsError::InvalidConfig(format!(
            "Unknown metrics adapter: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_metrics() {
        let metrics = NoOpMetricsPublisher::new();

        metrics.incr("task.created").await;
        metrics.incr_with_tags("task.completed", &[("type", "start")]).await;
        metrics.count("task.swept", 5).await;
        metrics.gauge("contexts.live", 100).await;
        metrics.time("task.duration", 42).await;
    }

    #[test]
    fn test_create_noop_publisher() {
        let config = MetricsConfig {
            adapter: "noop".to_string(),
            ..Default::default()
        };
        assert!(create_metrics_publisher(&config).is_ok());
    }

    #[test]
    fn test_missing_statsd_host() {
        let config = MetricsConfig {
            adapter: "statsd".to_string(),
            statsd_host: None,
            prefix: "provisor".to_string(),
            statsd_bind: "[::]:0".to_string(),
            tags: None,
        };
        let result = create_metrics_publisher(&config);
        assert!(matches!(result, Err(MetricsError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let config = MetricsConfig {
            adapter: "prometheus".to_string(),
            ..Default::default()
        };
        assert!(create_metrics_publisher(&config).is_err());
    }
}
