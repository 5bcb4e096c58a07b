//! Config — the user-declared intent document.
//!
//! A single `Config` lives in the store under `configs/global`. It is
//! authored by the operator (`wsomgr apply`) and replaced whole, never
//! patched. Managers only ever read it.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// The global configuration singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralSettings,
    pub managers: Vec<ManagerConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerConfig>,
}

impl Config {
    pub fn manager(&self, name: &str) -> Option<&ManagerConfig> {
        self.managers.iter().find(|m| m.name == name)
    }

    /// Every manager except `self_name`.
    pub fn other_managers<'a>(
        &'a self,
        self_name: &'a str,
    ) -> impl Iterator<Item = &'a ManagerConfig> {
        self.managers.iter().filter(move |m| m.name != self_name)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn load_balancer_for(&self, service: &str) -> Option<&LoadBalancerConfig> {
        self.load_balancers.iter().find(|lb| lb.service == service)
    }

    /// Majority over the managers known to this config: `ceil(N/2)`.
    pub fn quorum(&self) -> usize {
        self.managers.len().div_ceil(2)
    }

    /// Structural checks applied before a config is uploaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, m) in self.managers.iter().enumerate() {
            if self.managers[..i].iter().any(|o| o.name == m.name) {
                return Err(ConfigError::DuplicateManager(m.name.clone()));
            }
            if self.managers[..i].iter().any(|o| o.token == m.token) {
                return Err(ConfigError::DuplicateToken(m.name.clone()));
            }
        }
        for (i, s) in self.services.iter().enumerate() {
            if self.services[..i].iter().any(|o| o.name == s.name) {
                return Err(ConfigError::DuplicateService(s.name.clone()));
            }
        }
        for (i, lb) in self.load_balancers.iter().enumerate() {
            if self.service(&lb.service).is_none() {
                return Err(ConfigError::UnknownService(lb.service.clone()));
            }
            if self.load_balancers[..i].iter().any(|o| o.service == lb.service) {
                return Err(ConfigError::DuplicateLoadBalancer(lb.service.clone()));
            }
        }
        Ok(())
    }
}

/// Errors raised by [`Config::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manager '{0}' is declared more than once")]
    DuplicateManager(String),

    #[error("manager '{0}' reuses another manager's token")]
    DuplicateToken(String),

    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("load balancer references unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' has more than one load balancer")]
    DuplicateLoadBalancer(String),
}

/// Cluster-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Grace period after the last beat beyond which a token is dead.
    #[serde(with = "secs")]
    pub max_inactive: TimeDelta,
}

/// One peer process on one physical host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub name: String,
    pub address: Ipv4Addr,
    #[serde(default = "default_manager_port")]
    pub port: u16,
    /// Identifies this manager on its outbound heartbeat streams.
    pub token: Uuid,
    /// Directory holding base images and per-VM disks on this host.
    pub imgs_path: String,
    /// Inclusive IPv4 range this manager hands out to its workers.
    pub address_pool: AddressPool,
}

impl ManagerConfig {
    pub fn host(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn default_manager_port() -> u16 {
    8000
}

/// A replicated service fronted by zero or one load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Base image file under the owning manager's `imgs_path`.
    pub image: String,
    pub port: u16,
    pub replicas: usize,
}

/// Binds a public address:port to a service's workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub service: String,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_lb_image")]
    pub image: String,
}

fn default_lb_image() -> String {
    "nginx.qcow2".to_string()
}

/// An inclusive IPv4 range, written `"A-B"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressPool {
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(self.start) <= u32::from(address) && u32::from(address) <= u32::from(self.end)
    }

    /// Addresses in ascending order; allocation is first-fit over this.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }

    pub fn len(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start)) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Error)]
#[error("invalid address pool '{0}', expected 'A-B'")]
pub struct ParsePoolError(String);

impl FromStr for AddressPool {
    type Err = ParsePoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once('-').ok_or_else(|| ParsePoolError(s.to_string()))?;
        let start: Ipv4Addr = start.trim().parse().map_err(|_| ParsePoolError(s.to_string()))?;
        let end: Ipv4Addr = end.trim().parse().map_err(|_| ParsePoolError(s.to_string()))?;
        if u32::from(start) > u32::from(end) {
            return Err(ParsePoolError(s.to_string()));
        }
        Ok(Self { start, end })
    }
}

impl Serialize for AddressPool {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressPool {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Durations as fractional seconds, matching the stored JSON form.
mod secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.num_milliseconds() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Ok(TimeDelta::milliseconds((seconds * 1000.0).round() as i64))
    }
}
