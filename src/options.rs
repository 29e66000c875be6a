//! Connection string parsing and the per-cluster option structs derived from it.
//!
//! Mirrors the teacher's hand-rolled `ConnectionString`/`ServerAddress` parsing: no URL crate,
//! just `find`/`split` and [`percent_encoding`] for decoding reserved characters.

use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};

use crate::{
    error::{Error, ErrorKind, Result},
    retry::{BestEffortRetryStrategy, SharedRetryStrategy},
};

const DEFAULT_KV_PORT: u16 = 11210;
const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// A single `host[:port]` entry from a connection string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    /// Hostname or IP literal.
    pub host: String,
    /// Explicit port, if the connection string gave one.
    pub port: Option<u16>,
}

impl ServerAddress {
    fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::invalid_argument("empty host in connection string"));
        }
        match s.rfind(':') {
            Some(index) => {
                let (host, port) = (&s[..index], &s[index + 1..]);
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid port: {port}")))?;
                Ok(Self {
                    host: host.to_string(),
                    port: Some(port),
                })
            }
            None => Ok(Self {
                host: s.to_string(),
                port: None,
            }),
        }
    }

    pub(crate) fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// The parsed, not-yet-validated pieces of a `clusterkv[s]://` connection string. Separated
/// from [`ClusterOptions`] so that option resolution (timeouts, retry strategy) can be
/// overridden programmatically after parsing, matching how the teacher layers
/// `ConnectionString` underneath `ClientOptions`.
#[derive(Clone, Debug)]
pub struct ConnectionString {
    /// Whether the `s` suffix (`clusterkvs://`) requested TLS.
    pub tls: bool,
    /// The seed node list.
    pub hosts: Vec<ServerAddress>,
    /// Raw, percent-decoded `key=value` query options.
    pub options: HashMap<String, String>,
}

fn percent_decode(s: &str, what: &str) -> Result<String> {
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| Error::invalid_argument(format!("{what} must be valid percent-encoded UTF-8")))
}

/// Splits `s` at `index`, returning `(before, after)` with `after` being `None` if `index` is
/// the last character.
fn exclusive_split_at(s: &str, index: usize) -> (Option<&str>, Option<&str>) {
    let (before, after) = s.split_at(index);
    let before = if before.is_empty() { None } else { Some(before) };
    let after = if after.len() == 1 {
        None
    } else {
        Some(&after[1..])
    };
    (before, after)
}

impl ConnectionString {
    /// Parses a `clusterkv://host[:port][,host...][?opt=val&...]` connection string.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let end_of_scheme = s
            .find("://")
            .ok_or_else(|| Error::invalid_argument("connection string contains no scheme"))?;

        let tls = match &s[..end_of_scheme] {
            "clusterkv" => false,
            "clusterkvs" => true,
            other => {
                return Err(Error::invalid_argument(format!(
                    "invalid connection string scheme: {other}"
                )))
            }
        };

        let after_scheme = &s[end_of_scheme + 3..];
        let (hosts_section, options_section) = match after_scheme.find('?') {
            Some(index) => exclusive_split_at(after_scheme, index),
            None => (Some(after_scheme), None),
        };
        let hosts_section = hosts_section.unwrap_or_default();
        if hosts_section.is_empty() {
            return Err(Error::invalid_argument("missing hosts"));
        }

        let mut hosts = Vec::new();
        for host in hosts_section.split(',') {
            hosts.push(ServerAddress::parse(host)?);
        }

        let mut options = HashMap::new();
        if let Some(options_section) = options_section {
            for pair in options_section.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = match pair.find('=') {
                    Some(index) => exclusive_split_at(pair, index),
                    None => {
                        return Err(Error::invalid_argument(format!(
                            "option {pair} is missing a value"
                        )))
                    }
                };
                let key = key.ok_or_else(|| Error::invalid_argument("empty option name"))?;
                let value = percent_decode(value.unwrap_or_default(), "option value")?;
                options.insert(key.to_ascii_lowercase(), value);
            }
        }

        Ok(Self {
            tls,
            hosts,
            options,
        })
    }

    fn bool_option(&self, key: &str, default: bool) -> Result<bool> {
        match self.options.get(key) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                other => Err(Error::invalid_argument(format!(
                    "invalid boolean value for {key}: {other}"
                ))),
            },
        }
    }

    fn duration_ms_option(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.options.get(key) {
            None => Ok(default),
            Some(v) => {
                let ms: u64 = v
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid duration for {key}: {v}")))?;
                Ok(Duration::from_millis(ms))
            }
        }
    }
}

/// Per-service operation timeouts (spec §6). Defaults match the documented table.
#[derive(Clone, Copy, Debug)]
pub struct ServiceTimeouts {
    /// Key-value operations. Default 2500ms.
    pub kv: Duration,
    /// N1QL/SQL++ query service. Default 75000ms.
    pub query: Duration,
    /// Analytics service. Default 75000ms.
    pub analytics: Duration,
    /// Full-text search. Default 75000ms.
    pub search: Duration,
    /// Map-reduce views. Default 75000ms.
    pub views: Duration,
    /// Cluster/bucket/user management. Default 75000ms.
    pub management: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            kv: Duration::from_millis(2_500),
            query: Duration::from_millis(75_000),
            analytics: Duration::from_millis(75_000),
            search: Duration::from_millis(75_000),
            views: Duration::from_millis(75_000),
            management: Duration::from_millis(75_000),
        }
    }
}

/// TLS material and verification mode for a cluster connection. Construction is deliberately
/// split from [`crate::runtime::tls_rustls::TlsConfig`]/`tls_openssl::TlsConfig`: this struct is
/// the serializable, user-facing configuration, the `TlsConfig` types are the compiled
/// connector built from it once per cluster.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Corresponds to `ssl=no_verify`: accept any server certificate. Never the default.
    pub accept_all_certs: bool,
    /// Explicit trust roots (`trust_certificate`), DER-encoded. `None` falls back to the
    /// bundled Mozilla root store.
    #[cfg(feature = "rustls-tls")]
    pub root_certificates: Option<Vec<rustls::pki_types::CertificateDer<'static>>>,
    /// PEM CA bundle path, openssl backend only.
    #[cfg(feature = "openssl-tls")]
    pub ca_file_path: Option<PathBuf>,
    /// PEM client certificate+key path, openssl backend only.
    #[cfg(feature = "openssl-tls")]
    pub cert_key_file_path: Option<PathBuf>,
}

/// The identity a cluster authenticates with (spec §4.B handshake). Resolved separately from the
/// connection string: credentials are passed to `Cluster::connect` directly rather than embedded
/// in the URI, the way the teacher keeps `Credential` split from `ClientOptions`.
#[derive(Clone)]
pub struct Credential {
    /// The username to authenticate with.
    pub username: String,
    /// The password to authenticate with.
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully resolved options for a [`crate::client::Cluster`], produced by parsing a
/// [`ConnectionString`] and applying defaults.
#[derive(Clone)]
pub struct ClusterOptions {
    /// Seed nodes used to bootstrap the cluster map.
    pub seeds: Vec<ServerAddress>,
    /// Whether to connect over TLS.
    pub tls_enabled: bool,
    /// TLS material, required if `tls_enabled`.
    pub tls: Option<TlsOptions>,
    /// `network` option: selects which address family in `nodesExt` to prefer
    /// (`default`/`external`), for clusters behind NAT.
    pub network: Option<String>,
    /// Whether mutation tokens are requested during HELLO.
    pub enable_mutation_tokens: bool,
    /// Whether clustermap-change-notification is requested during HELLO.
    pub enable_clustermap_notification: bool,
    /// Deadline for establishing a fresh KV socket.
    pub kv_connect_timeout: Duration,
    /// Per-service operation timeouts.
    pub timeouts: ServiceTimeouts,
    /// Default retry strategy for requests that don't override it.
    pub retry_strategy: SharedRetryStrategy,
    /// Identity to authenticate with when opening a bucket session.
    pub credential: Credential,
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("seeds", &self.seeds)
            .field("tls_enabled", &self.tls_enabled)
            .field("network", &self.network)
            .field("enable_mutation_tokens", &self.enable_mutation_tokens)
            .field(
                "enable_clustermap_notification",
                &self.enable_clustermap_notification,
            )
            .field("kv_connect_timeout", &self.kv_connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ClusterOptions {
    /// Parses `s` and resolves it into fully-defaulted options, authenticating as `credential`.
    pub fn parse(s: impl AsRef<str>, credential: Credential) -> Result<Self> {
        let cs = ConnectionString::parse(s)?;
        Self::from_connection_string(cs, credential)
    }

    fn from_connection_string(cs: ConnectionString, credential: Credential) -> Result<Self> {
        let accept_all_certs = cs.bool_option("ssl", false).ok().unwrap_or(false)
            || matches!(cs.options.get("ssl").map(String::as_str), Some("no_verify"));
        let enable_mutation_tokens = cs.bool_option("enable_mutation_tokens", true)?;
        let enable_clustermap_notification =
            cs.bool_option("enable_clustermap_notification", true)?;
        let kv_connect_timeout =
            cs.duration_ms_option("kv_connect_timeout", Duration::from_secs(10))?;
        let network = cs.options.get("network").cloned();

        let tls_enabled = cs.tls || cs.bool_option("enable_tls", false)?;
        let tls = if tls_enabled {
            Some(TlsOptions {
                accept_all_certs,
                ..Default::default()
            })
        } else {
            None
        };

        Ok(Self {
            seeds: cs.hosts,
            tls_enabled,
            tls,
            network,
            enable_mutation_tokens,
            enable_clustermap_notification,
            kv_connect_timeout,
            timeouts: ServiceTimeouts::default(),
            retry_strategy: std::sync::Arc::new(BestEffortRetryStrategy::default()),
            credential,
        })
    }

    pub(crate) fn default_kv_port(&self) -> u16 {
        if self.tls_enabled {
            DEFAULT_KV_TLS_PORT
        } else {
            DEFAULT_KV_PORT
        }
    }
}

/// Durability requirements attached to a mutation (spec §6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DurabilityRequirement {
    /// Synchronous (server-side quorum) level, if any.
    pub level: Option<DurabilityLevel>,
    /// Legacy client-driven persist-to count.
    pub persist_to: PersistTo,
    /// Legacy client-driven replicate-to count.
    pub replicate_to: ReplicateTo,
}

impl DurabilityRequirement {
    /// No durability requirement beyond the implicit single-node ack.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether legacy observe-based polling is needed (i.e. `persist_to`/`replicate_to` are set
    /// and no synchronous level was requested).
    pub(crate) fn needs_observe_poll(&self) -> bool {
        self.level.is_none() && (self.persist_to != PersistTo::None || self.replicate_to != ReplicateTo::None)
    }
}

/// Synchronous durability level, encoded byte-for-byte as
/// `original_source/couchbase/protocol/durability_level_fmt.hxx` documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    /// No synchronous durability.
    None = 0,
    /// Acknowledged once a majority of configured nodes have it in memory.
    Majority = 1,
    /// Majority, and persisted to disk on the active node.
    MajorityAndPersistToActive = 2,
    /// Persisted to disk on a majority of nodes.
    PersistToMajority = 3,
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Majority => "majority",
            Self::MajorityAndPersistToActive => "majority_and_persist_to_active",
            Self::PersistToMajority => "persist_to_majority",
        };
        f.write_str(s)
    }
}

/// Legacy client-side persist-to requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PersistTo {
    /// No requirement.
    #[default]
    None,
    /// Persisted on the given number of nodes (active counts as one).
    N(u8),
}

/// Legacy client-side replicate-to requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplicateTo {
    /// No requirement.
    #[default]
    None,
    /// Replicated to the given number of replica nodes.
    N(u8),
}

/// Per-mutation configuration inputs (spec §6): everything a `store`/`remove`/`counter` call can
/// set beyond the document id and value.
#[derive(Clone, Debug, Default)]
pub struct MutationOptions {
    /// Application-defined flags stored alongside the value.
    pub flags: u32,
    /// Expiry in seconds from now; `0` means "never expires".
    pub expiry_secs: u32,
    /// CAS to guard the write with; `0` means unconditional.
    pub cas: u64,
    /// Durability requirement for the write.
    pub durability: DurabilityRequirement,
    /// Keep the document's existing expiry instead of resetting it to `expiry_secs`.
    pub preserve_expiry: bool,
    /// Per-operation timeout, overriding `ServiceTimeouts::kv` when set.
    pub timeout: Option<Duration>,
    /// Retry strategy for this one operation, overriding `ClusterOptions::retry_strategy`.
    pub retry_strategy: Option<SharedRetryStrategy>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_single_host() {
        let cs = ConnectionString::parse("clusterkv://node1.example.com").unwrap();
        assert!(!cs.tls);
        assert_eq!(cs.hosts.len(), 1);
        assert_eq!(cs.hosts[0].host, "node1.example.com");
        assert_eq!(cs.hosts[0].port, None);
    }

    #[test]
    fn parses_multiple_hosts_with_ports_and_options() {
        let cs = ConnectionString::parse(
            "clusterkvs://a.example.com:11210,b.example.com:11210?network=external&enable_tls=true",
        )
        .unwrap();
        assert!(cs.tls);
        assert_eq!(cs.hosts.len(), 2);
        assert_eq!(cs.hosts[1].port, Some(11210));
        assert_eq!(cs.options.get("network").unwrap(), "external");
    }

    #[test]
    fn rejects_missing_scheme() {
        let err = ConnectionString::parse("node1.example.com").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = ConnectionString::parse("redis://node1").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn resolves_cluster_options_defaults() {
        let opts = ClusterOptions::parse(
            "clusterkv://node1",
            Credential { username: "user".into(), password: "pass".into() },
        )
        .unwrap();
        assert!(!opts.tls_enabled);
        assert!(opts.enable_mutation_tokens);
        assert_eq!(opts.default_kv_port(), DEFAULT_KV_PORT);
    }

    #[test]
    fn durability_requirement_needs_observe_poll_only_without_sync_level() {
        let mut req = DurabilityRequirement {
            persist_to: PersistTo::N(1),
            ..Default::default()
        };
        assert!(req.needs_observe_poll());
        req.level = Some(DurabilityLevel::Majority);
        assert!(!req.needs_observe_poll());
    }
}
