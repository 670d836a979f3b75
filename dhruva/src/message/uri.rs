use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use util::WireStr;

use crate::error::{Error, Result};
use crate::parser::Parser;

use super::Method;

/// The scheme of a URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `sip:`
    Sip,
    /// `sips:`
    Sips,
    /// `tel:` and any other scheme, as found on the wire.
    Other(WireStr),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Other(s) => s.as_str().unwrap_or("unknown"),
        }
    }
}

impl From<WireStr> for Scheme {
    fn from(value: WireStr) -> Self {
        if value.eq_ignore_case("sip") {
            Scheme::Sip
        } else if value.eq_ignore_case("sips") {
            Scheme::Sips
        } else {
            Scheme::Other(value)
        }
    }
}

/// The host part of a URI or Via sent-by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A host name.
    Domain(WireStr),
    /// An IPv4 or IPv6 address.
    IpAddr(IpAddr),
}

impl Host {
    /// Classifies `value`, brackets around IPv6 addresses are optional.
    pub fn from_wire(value: WireStr) -> Self {
        let text = value.as_str().map(|s| s.trim_start_matches('[').trim_end_matches(']'));
        match text.and_then(|s| s.parse().ok()) {
            Some(addr) => Host::IpAddr(addr),
            None => Host::Domain(value),
        }
    }

    pub fn is_ip_addr(&self) -> bool {
        matches!(self, Host::IpAddr(_))
    }

    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self {
            Host::IpAddr(addr) => Some(*addr),
            Host::Domain(_) => None,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(domain) => write!(f, "{domain}"),
            Host::IpAddr(IpAddr::V6(addr)) => write!(f, "[{addr}]"),
            Host::IpAddr(IpAddr::V4(addr)) => write!(f, "{addr}"),
        }
    }
}

/// A host with an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// A `name[=value]` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: WireStr,
    pub value: Option<WireStr>,
}

/// An ordered list of parameters, looked up case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Params(Vec<Param>);

impl Params {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the value of `name`.
    ///
    /// The outer `Option` tells whether the parameter is present.
    pub fn get(&self, name: &str) -> Option<Option<&WireStr>> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_case(name))
            .map(|p| p.value.as_ref())
    }

    /// Returns the value of `name`, `None` when absent or valueless.
    pub fn value(&self, name: &str) -> Option<&WireStr> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: WireStr, value: Option<WireStr>) {
        self.0.push(Param { name, value });
    }

    /// Replaces the value of `name` or appends it.
    pub fn set(&mut self, name: &'static str, value: Option<WireStr>) {
        match self.0.iter_mut().find(|p| p.name.eq_ignore_case(name)) {
            Some(param) => param.value = value,
            None => self.push(WireStr::from_static(name), value),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let index = self.0.iter().position(|p| p.name.eq_ignore_case(name))?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Writes the parameters with the given leading and joining separator.
    pub(crate) fn write_with(&self, f: &mut fmt::Formatter<'_>, first: char, sep: char) -> fmt::Result {
        for (i, Param { name, value }) in self.0.iter().enumerate() {
            let c = if i == 0 { first } else { sep };
            write!(f, "{c}{name}")?;
            if let Some(value) = value {
                write!(f, "={value}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with(f, ';', ';')
    }
}

/// A SIP URI.
///
/// `sip:user:password@host:port;uri-parameters?headers`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<WireStr>,
    pub password: Option<WireStr>,
    pub host_port: HostPort,
    pub params: Params,
    pub headers: Params,
}

impl Uri {
    /// Creates a `sip:` URI with no user part.
    pub fn new(host_port: HostPort) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            password: None,
            host_port,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host_port.host
    }

    pub fn port(&self) -> Option<u16> {
        self.host_port.port
    }

    /// The `transport` parameter.
    pub fn transport_param(&self) -> Option<&WireStr> {
        self.params.value("transport")
    }

    /// The `method` parameter.
    pub fn method_param(&self) -> Option<Method> {
        self.params.value("method").cloned().map(Method::from)
    }

    /// `true` for a loose route URI.
    pub fn is_lr(&self) -> bool {
        self.params.contains("lr")
    }

    /// `user@host` without port or parameters.
    pub fn user_at_host(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host_port.host),
            None => self.host_port.host.to_string(),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{user}")?;
            if let Some(password) = &self.password {
                write!(f, ":{password}")?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host_port)?;
        self.params.write_with(f, ';', ';')?;
        self.headers.write_with(f, '?', '&')
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Parser::parse_uri(&WireStr::from(s.to_string()))
    }
}

/// A URI with an optional display name, as found in `From`, `To`,
/// `Contact`, `Route` and `Record-Route`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameAddr {
    pub display: Option<WireStr>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&WireStr> {
        self.params.value("tag")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{display}\" ")?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// A `Via` header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Via {
    /// Transport token, `UDP`, `TCP`, `TLS`...
    pub transport: WireStr,
    pub sent_by: HostPort,
    pub params: Params,
}

impl Via {
    pub fn new(transport: WireStr, sent_by: HostPort, branch: WireStr) -> Self {
        let mut params = Params::new();
        params.push(WireStr::from_static("branch"), Some(branch));
        Self {
            transport,
            sent_by,
            params,
        }
    }

    pub fn branch(&self) -> Option<&WireStr> {
        self.params.value("branch")
    }

    pub fn received(&self) -> Option<&WireStr> {
        self.params.value("received")
    }

    pub fn rport(&self) -> Option<u16> {
        self.params.value("rport").and_then(|p| p.parse())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

/// A `CSeq` header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_uri_display() {
        let uri: Uri = "sip:alice:secret@example.com:5070;transport=tcp;lr?subject=hi&x=y"
            .parse()
            .unwrap();

        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_ref().unwrap(), "alice");
        assert_eq!(uri.password.as_ref().unwrap(), "secret");
        assert_eq!(uri.port(), Some(5070));
        assert_eq!(uri.transport_param().unwrap(), "tcp");
        assert!(uri.is_lr());
        assert_eq!(
            uri.to_string(),
            "sip:alice:secret@example.com:5070;transport=tcp;lr?subject=hi&x=y"
        );
    }

    #[test]
    fn test_host_classification() {
        let v4 = Host::from_wire("10.0.0.1".into());
        let v6 = Host::from_wire("[::1]".into());

        assert_eq!(v4, Host::IpAddr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(v6.to_string(), "[::1]");
        assert!(!Host::from_wire("example.com".into()).is_ip_addr());
    }

    #[test]
    fn test_params_are_case_insensitive() {
        let mut params = Params::new();
        params.push("Branch".into(), Some("z9hG4bK1".into()));
        params.push("lr".into(), None);

        assert_eq!(params.value("branch").unwrap(), "z9hG4bK1");
        assert_eq!(params.get("lr"), Some(None));

        params.set("branch", Some("z9hG4bK2".into()));
        assert_eq!(params.to_string(), ";Branch=z9hG4bK2;lr");
    }
}
