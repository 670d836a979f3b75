//! Certificate revocation checks.
//!
//! The revoked serial numbers, per issuer common name, are refreshed out of
//! band through [`RevocationCache::replace`] or [`RevocationCache::update`].
//! Handshakes only read the current snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

type RevokedMap = HashMap<String, HashSet<String>>;

/// Revoked serial numbers per issuer common name.
#[derive(Debug, Default)]
pub struct RevocationCache {
    revoked: ArcSwap<RevokedMap>,
}

impl RevocationCache {
    /// Replaces the whole map.
    pub fn replace<I, S>(&self, revoked: I)
    where
        I: IntoIterator<Item = (String, Vec<S>)>,
        S: AsRef<str>,
    {
        let map = revoked
            .into_iter()
            .map(|(issuer, serials)| (issuer, serials.iter().map(|s| normalize_serial(s.as_ref())).collect()))
            .collect();
        self.revoked.store(Arc::new(map));
    }

    /// Replaces the serial numbers of one issuer.
    pub fn update<S: AsRef<str>>(&self, issuer: &str, serials: &[S]) {
        let serials: HashSet<String> = serials.iter().map(|s| normalize_serial(s.as_ref())).collect();
        self.revoked.rcu(|current| {
            let mut map = RevokedMap::clone(current);
            map.insert(issuer.to_string(), serials.clone());
            map
        });
    }

    pub fn is_known_issuer(&self, issuer: &str) -> bool {
        self.revoked.load().contains_key(issuer)
    }

    pub fn is_revoked(&self, issuer: &str, serial: &str) -> bool {
        self.revoked
            .load()
            .get(issuer)
            .is_some_and(|serials| serials.contains(&normalize_serial(serial)))
    }
}

/// What to do with a revoked certificate, or one from an unknown issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Reject the handshake.
    HardFail,
    /// Log a warning and go on.
    SoftFail,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    #[error("certificate {serial} of '{issuer}' is revoked")]
    Revoked { issuer: String, serial: String },

    #[error("no revocation list for issuer '{0}'")]
    UnknownIssuer(String),

    #[error("unreadable certificate: {0}")]
    BadCertificate(String),
}

impl From<RevocationError> for rustls::Error {
    fn from(err: RevocationError) -> Self {
        let cause = match err {
            RevocationError::Revoked { .. } => rustls::CertificateError::Revoked,
            RevocationError::UnknownIssuer(_) => rustls::CertificateError::UnknownIssuer,
            RevocationError::BadCertificate(_) => rustls::CertificateError::BadEncoding,
        };
        rustls::Error::InvalidCertificate(cause)
    }
}

/// Applies a [`RevocationPolicy`] to peer certificates.
#[derive(Debug)]
pub struct RevocationChecker {
    cache: Arc<RevocationCache>,
    policy: RevocationPolicy,
}

impl RevocationChecker {
    pub fn new(cache: Arc<RevocationCache>, policy: RevocationPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> RevocationPolicy {
        self.policy
    }

    pub fn cache(&self) -> &Arc<RevocationCache> {
        &self.cache
    }

    /// Checks the certificate `serial` issued by `issuer`.
    pub fn check(&self, issuer: &str, serial: &str) -> Result<(), RevocationError> {
        let failure = if !self.cache.is_known_issuer(issuer) {
            RevocationError::UnknownIssuer(issuer.to_string())
        } else if self.cache.is_revoked(issuer, serial) {
            RevocationError::Revoked {
                issuer: issuer.to_string(),
                serial: normalize_serial(serial),
            }
        } else {
            return Ok(());
        };

        self.apply(failure)
    }

    /// Checks a DER encoded certificate.
    pub fn check_der(&self, der: &[u8]) -> Result<(), RevocationError> {
        match certificate_identity(der) {
            Ok((issuer, serial)) => self.check(&issuer, &serial),
            Err(err) => self.apply(err),
        }
    }

    fn apply(&self, failure: RevocationError) -> Result<(), RevocationError> {
        match self.policy {
            RevocationPolicy::HardFail => {
                log::error!("Rejecting peer certificate: {}", failure);
                Err(failure)
            }
            RevocationPolicy::SoftFail => {
                log::warn!("Accepting peer certificate anyway: {}", failure);
                Ok(())
            }
        }
    }
}

/// Issuer common name and hex serial number of a DER certificate.
pub fn certificate_identity(der: &[u8]) -> Result<(String, String), RevocationError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|err| RevocationError::BadCertificate(err.to_string()))?;

    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| RevocationError::BadCertificate("issuer without common name".into()))?
        .to_string();
    let serial: String = cert.raw_serial().iter().map(|b| format!("{b:02X}")).collect();

    Ok((issuer, normalize_serial(&serial)))
}

/// Uppercase hex without separators nor leading zeros.
fn normalize_serial(serial: &str) -> String {
    let hex: String = serial
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let trimmed = hex.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
