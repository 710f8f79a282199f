use std::time::Duration;

/// Configuration for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Site host that relative URLs are anchored to, e.g. `www.example.com`.
    pub site: String,

    /// Maximum number of concurrently running tasks.
    ///
    /// Defaults to 6, the per-origin connection ceiling browsers apply to
    /// the target site.
    pub concurrency: usize,

    /// Deadline for a single network fetch.
    pub request_timeout: Duration,

    /// Interval between statistics snapshots published to a sink.
    pub stats_interval: Duration,
}

impl SchedulerConfig {
    pub fn for_site(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            site: "www.example.com".to_string(),
            concurrency: 6,
            request_timeout: Duration::from_secs(20),
            stats_interval: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sensible() {
        let config = SchedulerConfig::default();
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.stats_interval, Duration::from_secs(2));
    }

    #[test]
    fn builder_overrides() {
        let config = SchedulerConfig::for_site("www.shop.example")
            .with_concurrency(1)
            .with_request_timeout(Duration::from_millis(50));
        assert_eq!(config.site, "www.shop.example");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.request_timeout, Duration::from_millis(50));
    }
}
