use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::{DashMap, DashSet};

use crate::error::{Error, ResolutionFailure, Result};
use crate::resolver::{ARecord, DnsLookup, SrvRecord};

/// In memory DNS answers.
#[derive(Default)]
pub struct MockLookup {
    srv: DashMap<String, Vec<SrvRecord>>,
    a: DashMap<String, Vec<IpAddr>>,
    failing: DashSet<String>,
    queries: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
}

impl MockLookup {
    /// SRV answers as `(priority, port, target)`.
    pub fn add_srv(&self, name: &str, records: &[(u16, u16, &str)]) {
        let records = records
            .iter()
            .map(|(priority, port, target)| SrvRecord {
                name: name.to_string(),
                ttl: 60,
                priority: *priority,
                weight: 0,
                port: *port,
                target: target.to_string(),
            })
            .collect();
        self.srv.insert(name.to_string(), records);
    }

    pub fn add_a(&self, name: &str, addresses: &[&str]) {
        let addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
        self.a.insert(name.to_string(), addresses);
    }

    /// Queries of `name` fail like a server failure.
    pub fn fail(&self, name: &str) {
        self.failing.insert(name.to_string());
    }

    /// Every answer takes `delay`.
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    async fn query(&self, name: &str) -> Result<()> {
        self.queries.lock().unwrap().push(name.to_string());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(name) {
            return Err(Error::Resolution(ResolutionFailure {
                name: name.to_string(),
                reason: "SERVFAIL".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DnsLookup for MockLookup {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        self.query(name).await?;
        Ok(self.srv.get(name).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn a(&self, name: &str) -> Result<Vec<ARecord>> {
        self.query(name).await?;
        let addresses = self.a.get(name).map(|r| r.value().clone()).unwrap_or_default();
        Ok(addresses
            .into_iter()
            .map(|address| ARecord {
                name: name.to_string(),
                ttl: 60,
                address,
            })
            .collect())
    }
}
