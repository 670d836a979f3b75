//! DNS resolve with the `DnsResolver` type.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};

/// One answer of a SRV query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvAnswer {
    /// Record priority, lower is preferred.
    pub priority: u16,
    /// Record weight among records with the same priority.
    pub weight: u16,
    /// Service port.
    pub port: u16,
    /// Target host name, fully qualified.
    pub target: String,
}

/// Tunables of the [`DnsResolver`].
#[derive(Debug, Clone)]
pub struct DnsOptions {
    /// Query timeout.
    pub timeout: Duration,
    /// Number of cached answers.
    pub cache_size: usize,
    /// Upper bound of the time an answer is kept in cache.
    pub retention: Duration,
    /// Name servers to use instead of the system configuration.
    pub servers: Vec<IpAddr>,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            cache_size: 1000,
            retention: Duration::from_secs(3600),
            servers: Vec::new(),
        }
    }
}

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: TokioResolver,
}

impl DnsResolver {
    /// Creates a resolver from the system configuration.
    pub fn from_system_conf() -> Result<Self, io::Error> {
        Self::with_options(&DnsOptions::default())
    }

    /// Creates a resolver with the given options.
    ///
    /// The system configuration is used unless `options.servers` is not empty.
    pub fn with_options(options: &DnsOptions) -> Result<Self, io::Error> {
        let mut builder = if options.servers.is_empty() {
            TokioResolver::builder_tokio().map_err(|err| {
                io::Error::other(format!("Failed to read system DNS configuration: {}", err))
            })?
        } else {
            let group = NameServerConfigGroup::from_ips_clear(&options.servers, 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
        };

        let opts = builder.options_mut();
        opts.timeout = options.timeout;
        opts.cache_size = options.cache_size as _;
        opts.positive_max_ttl = Some(options.retention);

        Ok(Self {
            dns_resolver: builder.build(),
        })
    }

    /// Resolve a single.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        self.resolve_all(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("No address for {}", host)))
    }

    /// Resolve all the A and AAAA records of `host`.
    ///
    /// A name without records yields an empty list.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        match self.dns_resolver.lookup_ip(host).await {
            Ok(result) => Ok(result.iter().collect()),
            Err(err) if err.is_no_records_found() => Ok(Vec::new()),
            Err(err) => Err(lookup_error(err)),
        }
    }

    /// Resolve the SRV records of `name`, in answer order.
    ///
    /// A name without records yields an empty list.
    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvAnswer>, io::Error> {
        let lookup = match self.dns_resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_no_records_found() => return Ok(Vec::new()),
            Err(err) => return Err(lookup_error(err)),
        };

        let answers = lookup
            .iter()
            .map(|srv| SrvAnswer {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_string(),
            })
            .collect();

        Ok(answers)
    }
}

fn lookup_error(err: ResolveError) -> io::Error {
    io::Error::other(format!("Failed to lookup DNS: {}", err))
}
