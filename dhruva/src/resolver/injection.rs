//! Synthetic DNS answers.
//!
//! Records injected here are merged with, or replace, the live answers of
//! the same name. They drive failover tests without a name server and let
//! operators steer a user's calls.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{ARecord, SrvRecord};

const GLOBAL: &str = "global";

/// How injected records combine with the live ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectAction {
    /// Injected records come first, live ones are kept.
    #[default]
    Prepend,
    /// Live records of the same name are dropped.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedSrv {
    #[serde(flatten)]
    pub record: SrvRecord,
    #[serde(default)]
    pub inject_action: InjectAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedA {
    #[serde(flatten)]
    pub record: ARecord,
    #[serde(default)]
    pub inject_action: InjectAction,
}

/// Injected records matching one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injected<T> {
    pub records: Vec<T>,
    pub replace: bool,
}

impl<T> Injected<T> {
    fn none() -> Self {
        Self {
            records: Vec::new(),
            replace: false,
        }
    }
}

/// Per user SRV and A overrides, with a `global` fallback.
#[derive(Debug, Default)]
pub struct DnsInjectionService {
    srv: DashMap<String, Arc<Vec<InjectedSrv>>>,
    a: DashMap<String, Arc<Vec<InjectedA>>>,
}

impl DnsInjectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the SRV overrides of `user_id`, or the global ones.
    pub fn inject_srv(&self, user_id: Option<&str>, records: Vec<InjectedSrv>) {
        log::warn!("Injecting {} SRV records for {}", records.len(), make_key(user_id));
        let records = records
            .into_iter()
            .map(|mut injected| {
                injected.record.name = add_trailing_period(&injected.record.name);
                injected.record.target = add_trailing_period(&injected.record.target);
                injected
            })
            .collect();
        self.srv.insert(make_key(user_id), Arc::new(records));
    }

    /// Sets the A overrides of `user_id`, or the global ones.
    pub fn inject_a(&self, user_id: Option<&str>, records: Vec<InjectedA>) {
        log::warn!("Injecting {} A records for {}", records.len(), make_key(user_id));
        let records = records
            .into_iter()
            .map(|mut injected| {
                injected.record.name = add_trailing_period(&injected.record.name);
                injected
            })
            .collect();
        self.a.insert(make_key(user_id), Arc::new(records));
    }

    pub fn clear(&self, user_id: Option<&str>) {
        let key = make_key(user_id);
        self.srv.remove(&key);
        self.a.remove(&key);
    }

    /// The SRV overrides of `user_id`, falling back to the global ones.
    pub fn injected_srv(&self, user_id: Option<&str>) -> Arc<Vec<InjectedSrv>> {
        lookup(&self.srv, user_id)
    }

    /// The A overrides of `user_id`, falling back to the global ones.
    pub fn injected_a(&self, user_id: Option<&str>) -> Arc<Vec<InjectedA>> {
        lookup(&self.a, user_id)
    }

    /// Injected SRV records for the query `name`.
    pub fn srv_for(&self, user_id: Option<&str>, name: &str) -> Injected<SrvRecord> {
        let name = add_trailing_period(name);
        let mut found = Injected::none();
        for injected in self.injected_srv(user_id).iter() {
            if injected.record.name.eq_ignore_ascii_case(&name) {
                found.replace |= injected.inject_action == InjectAction::Replace;
                found.records.push(injected.record.clone());
            }
        }
        found
    }

    /// Injected A records for the query `name`.
    pub fn a_for(&self, user_id: Option<&str>, name: &str) -> Injected<ARecord> {
        let name = add_trailing_period(name);
        let mut found = Injected::none();
        for injected in self.injected_a(user_id).iter() {
            if injected.record.name.eq_ignore_ascii_case(&name) {
                found.replace |= injected.inject_action == InjectAction::Replace;
                found.records.push(injected.record.clone());
            }
        }
        found
    }
}

fn lookup<T>(map: &DashMap<String, Arc<Vec<T>>>, user_id: Option<&str>) -> Arc<Vec<T>> {
    let key = make_key(user_id);
    match map.get(&key) {
        Some(records) if !records.is_empty() => records.clone(),
        _ if key != GLOBAL => lookup(map, None),
        _ => Arc::new(Vec::new()),
    }
}

fn make_key(user_id: Option<&str>) -> String {
    match user_id {
        Some(user) if !user.is_empty() => user.to_lowercase(),
        _ => GLOBAL.to_string(),
    }
}

pub(crate) fn add_trailing_period(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}
