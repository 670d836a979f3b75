//! Static routes.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;

use crate::config::RouteConfig;
use crate::error::{Error, Result};
use crate::resolver::LookupType;

/// Where a request goes, before DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: Option<u16>,
    pub lookup: LookupType,
}

impl Destination {
    /// Reads `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(destination: &str, lookup: LookupType) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid destination '{destination}'"));
        let destination = destination.trim();

        let (host, port) = if let Some(rest) = destination.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if rest.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else if destination.matches(':').count() > 1 {
            (destination, None)
        } else {
            match destination.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (destination, None),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.map(|p| p.parse::<u16>().map_err(|_| invalid())).transpose()?;

        Ok(Self {
            host: host.to_string(),
            port,
            lookup,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, " ({})", self.lookup)
    }
}

#[derive(Debug)]
pub struct RoutePattern {
    regex: Regex,
    destination: Destination,
}

impl RoutePattern {
    pub fn new(pattern: &str, destination: Destination) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            destination,
        })
    }

    pub fn is_match(&self, uri: &str) -> bool {
        self.regex.is_match(uri)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// Patterns matched against the Request-URI, in registration order.
///
/// Every pattern is tried and the last one that matches wins. Routes are
/// appended while requests read the table.
#[derive(Debug, Default)]
pub struct RoutingTable {
    patterns: ArcSwap<Vec<Arc<RoutePattern>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[RouteConfig]) -> Result<Self> {
        let table = Self::new();
        for route in routes {
            table.add(&route.pattern, Destination::parse(&route.destination, route.transport)?)?;
        }
        Ok(table)
    }

    pub fn add(&self, pattern: &str, destination: Destination) -> Result<()> {
        let pattern = Arc::new(RoutePattern::new(pattern, destination)?);
        log::debug!("Adding route {} -> {}", pattern.regex, pattern.destination);
        self.patterns.rcu(|current| {
            let mut patterns = Vec::clone(current);
            patterns.push(pattern.clone());
            patterns
        });
        Ok(())
    }

    /// Every pattern is tried in insertion order and the last match wins.
    pub fn route(&self, uri: &str) -> Option<Destination> {
        let patterns = self.patterns.load();
        let mut result = None;
        for pattern in patterns.iter() {
            if pattern.is_match(uri) {
                result = Some(&pattern.destination);
            }
        }
        result.cloned()
    }

    pub fn len(&self) -> usize {
        self.patterns.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
