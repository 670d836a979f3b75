//! Raw DNS queries.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use util::DnsResolver;

use super::{ARecord, SrvRecord};
use crate::error::{Error, ResolutionFailure, Result};
use crate::metrics::{Metric, MetricName, MetricsSink};

/// SRV and A/AAAA queries.
///
/// A name without records is an empty answer, not an error.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    async fn a(&self, name: &str) -> Result<Vec<ARecord>>;
}

/// Queries the name servers through hickory.
pub struct HickoryLookup {
    resolver: DnsResolver,
}

impl HickoryLookup {
    pub fn new(resolver: DnsResolver) -> Self {
        Self { resolver }
    }
}

fn failure(name: &str, err: std::io::Error) -> Error {
    Error::Resolution(ResolutionFailure {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let answers = self.resolver.resolve_srv(name).await.map_err(|err| failure(name, err))?;

        Ok(answers
            .into_iter()
            .map(|answer| SrvRecord {
                name: name.to_string(),
                ttl: 0,
                priority: answer.priority,
                weight: answer.weight,
                port: answer.port,
                target: answer.target,
            })
            .collect())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn a(&self, name: &str) -> Result<Vec<ARecord>> {
        let addresses: Vec<IpAddr> = self.resolver.resolve_all(name).await.map_err(|err| failure(name, err))?;

        Ok(addresses
            .into_iter()
            .map(|address| ARecord {
                name: name.to_string(),
                ttl: 0,
                address,
            })
            .collect())
    }
}

/// Reports every query as a `dns` metric.
pub struct MeteredLookup {
    inner: Arc<dyn DnsLookup>,
    metrics: Arc<dyn MetricsSink>,
}

impl MeteredLookup {
    pub fn new(inner: Arc<dyn DnsLookup>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { inner, metrics }
    }

    fn report<T>(&self, query_type: &str, name: &str, started: Instant, result: &Result<Vec<T>>) {
        let metric = Metric::new(MetricName::Dns)
            .tag("queryType", query_type)
            .tag("query", name)
            .field("processingDelayInMillis", started.elapsed().as_millis() as u64);
        let metric = match result {
            Ok(records) => metric.field("totalHits", records.len()),
            Err(err) => metric.field("failureReason", err.to_string()),
        };
        self.metrics.emit(metric);
    }
}

#[async_trait]
impl DnsLookup for MeteredLookup {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let started = Instant::now();
        let result = self.inner.srv(name).await;
        self.report("SRV", name, started, &result);
        result
    }

    async fn a(&self, name: &str) -> Result<Vec<ARecord>> {
        let started = Instant::now();
        let result = self.inner.a(name).await;
        self.report("A", name, started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ChannelSink, FieldValue};
    use crate::test_utils::MockLookup;

    #[tokio::test]
    async fn test_metered_lookup_reports() {
        let mock = MockLookup::default();
        mock.add_a("sbc.example.com.", &["10.0.0.1", "10.0.0.2"]);
        let (sink, mut rx) = ChannelSink::new(4);
        let lookup = MeteredLookup::new(Arc::new(mock), Arc::new(sink));

        assert_eq!(lookup.a("sbc.example.com.").await.unwrap().len(), 2);
        assert!(lookup.srv("_sip._udp.nowhere.").await.unwrap().is_empty());

        let a = rx.recv().await.unwrap();
        assert_eq!(a.tags["queryType"], "A");
        assert_eq!(a.fields["totalHits"], FieldValue::Int(2));
        let srv = rx.recv().await.unwrap();
        assert_eq!(srv.tags["query"], "_sip._udp.nowhere.");
        assert_eq!(srv.fields["totalHits"], FieldValue::Int(0));
    }
}
