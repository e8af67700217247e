//! Connection and query options.
//!
//! These are forwarded to the engine as-is. The bridge only checks what
//! has to be rejected synchronously: combinations that can never work and
//! values that are not well-formed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connstr::{ConnectionString, ParamValue};
use crate::error::{Error, Result};

/// Serde helpers for durations written as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

fn default_sasl_mechanisms() -> Vec<String> {
    vec!["PLAIN".to_string()]
}

/// Username and password for the cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default = "default_sasl_mechanisms")]
    pub allowed_sasl_mechanisms: Vec<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            allowed_sasl_mechanisms: default_sasl_mechanisms(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("allowed_sasl_mechanisms", &self.allowed_sasl_mechanisms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpProtocol {
    #[default]
    Any,
    ForceIpv4,
    ForceIpv6,
}

impl FromStr for IpProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(IpProtocol::Any),
            "force_ipv4" => Ok(IpProtocol::ForceIpv4),
            "force_ipv6" => Ok(IpProtocol::ForceIpv6),
            other => Err(Error::invalid(format!(
                "ip_protocol must be any, force_ipv4 or force_ipv6, got '{}'",
                other
            ))),
        }
    }
}

/// Default operation timeouts for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOptions {
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect: Duration,
    #[serde(rename = "dispatch_timeout_ms", with = "duration_ms")]
    pub dispatch: Duration,
    #[serde(rename = "dns_srv_timeout_ms", with = "duration_ms")]
    pub dns_srv: Duration,
    #[serde(rename = "management_timeout_ms", with = "duration_ms")]
    pub management: Duration,
    #[serde(rename = "query_timeout_ms", with = "duration_ms")]
    pub query: Duration,
    #[serde(rename = "resolve_timeout_ms", with = "duration_ms")]
    pub resolve: Duration,
    #[serde(rename = "socket_connect_timeout_ms", with = "duration_ms")]
    pub socket_connect: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            dispatch: Duration::from_secs(30),
            dns_srv: Duration::from_millis(500),
            management: Duration::from_secs(75),
            query: Duration::from_secs(600),
            resolve: Duration::from_secs(2),
            socket_connect: Duration::from_secs(2),
        }
    }
}

/// Which certificates to trust.
///
/// At most one trust source may be chosen. The default trusts only the
/// Capella CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub trust_only_capella: bool,
    pub trust_only_pem_file: Option<PathBuf>,
    pub trust_only_pem_str: Option<String>,
    pub trust_only_certificates: Vec<String>,
    pub trust_only_platform: bool,
    pub verify_server_certificate: bool,
    pub cipher_suites: Vec<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            trust_only_capella: true,
            trust_only_pem_file: None,
            trust_only_pem_str: None,
            trust_only_certificates: Vec::new(),
            trust_only_platform: false,
            verify_server_certificate: true,
            cipher_suites: Vec::new(),
        }
    }
}

impl SecurityOptions {
    fn untrusting() -> Self {
        Self {
            trust_only_capella: false,
            ..Self::default()
        }
    }

    pub fn trust_only_capella() -> Self {
        Self::default()
    }

    pub fn trust_only_pem_file(path: impl Into<PathBuf>) -> Self {
        Self {
            trust_only_pem_file: Some(path.into()),
            ..Self::untrusting()
        }
    }

    pub fn trust_only_pem_str(pem: impl Into<String>) -> Self {
        Self {
            trust_only_pem_str: Some(pem.into()),
            ..Self::untrusting()
        }
    }

    pub fn trust_only_certificates(certificates: Vec<String>) -> Self {
        Self {
            trust_only_certificates: certificates,
            ..Self::untrusting()
        }
    }

    pub fn trust_only_platform() -> Self {
        Self {
            trust_only_platform: true,
            ..Self::untrusting()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let explicit = [
            self.trust_only_pem_file.is_some(),
            self.trust_only_pem_str.as_deref().is_some_and(|s| !s.is_empty()),
            !self.trust_only_certificates.is_empty(),
            self.trust_only_platform,
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if self.trust_only_capella && explicit > 0 {
            return Err(Error::invalid(
                "trust_only_capella cannot be combined with another trust source",
            ));
        }
        if explicit > 1 {
            return Err(Error::invalid("only one trust source may be set"));
        }
        Ok(())
    }
}

/// Options for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub num_io_threads: usize,
    pub enable_dns_srv: bool,
    pub dump_configuration: bool,
    /// Forward connection string parameters the bridge does not know.
    pub allow_unknown_params: bool,
    pub user_agent_extra: Option<String>,
    pub network: Option<String>,
    pub dns_nameserver: Option<String>,
    pub dns_port: Option<u16>,
    pub ip_protocol: IpProtocol,
    #[serde(rename = "config_poll_interval_ms", with = "duration_ms::option")]
    pub config_poll_interval: Option<Duration>,
    #[serde(rename = "config_poll_floor_ms", with = "duration_ms::option")]
    pub config_poll_floor: Option<Duration>,
    pub timeouts: TimeoutOptions,
    pub security: SecurityOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            num_io_threads: 1,
            enable_dns_srv: true,
            dump_configuration: false,
            allow_unknown_params: false,
            user_agent_extra: None,
            network: None,
            dns_nameserver: None,
            dns_port: None,
            ip_protocol: IpProtocol::Any,
            config_poll_interval: None,
            config_poll_floor: None,
            timeouts: TimeoutOptions::default(),
            security: SecurityOptions::default(),
        }
    }
}

impl ClusterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_io_threads(mut self, n: usize) -> Self {
        self.num_io_threads = n;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutOptions) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn security(mut self, security: SecurityOptions) -> Self {
        self.security = security;
        self
    }

    pub fn user_agent_extra(mut self, extra: impl Into<String>) -> Self {
        self.user_agent_extra = Some(extra.into());
        self
    }

    pub fn allow_unknown_params(mut self, allow: bool) -> Self {
        self.allow_unknown_params = allow;
        self
    }

    /// User agent reported to the engine.
    pub fn user_agent(&self) -> String {
        let base = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        match self.user_agent_extra.as_deref() {
            Some(extra) if !extra.is_empty() => format!("{};{}", base, extra),
            _ => base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_io_threads == 0 {
            return Err(Error::invalid("num_io_threads must be at least 1"));
        }
        self.security.validate()
    }

    /// Move recognised connection string parameters onto these options.
    ///
    /// Parameters left over are kept on `connstr` when
    /// `allow_unknown_params` is set and discarded otherwise.
    pub fn apply_params(&mut self, connstr: &mut ConnectionString) -> Result<()> {
        if let Some(v) = connstr.take_param("allow_unknown_params") {
            self.allow_unknown_params = want_bool("allow_unknown_params", v)?;
        }

        let keys: Vec<String> = connstr.params.keys().cloned().collect();
        for key in keys {
            let Some(value) = connstr.params.get(&key).cloned() else {
                continue;
            };
            if self.apply_param(&key, value)? {
                connstr.params.remove(&key);
            }
        }

        if !self.allow_unknown_params && !connstr.params.is_empty() {
            let unknown: Vec<&str> = connstr.params.keys().map(String::as_str).collect();
            warn!(?unknown, "ignoring unknown connection string parameters");
            connstr.params.clear();
        }
        Ok(())
    }

    fn apply_param(&mut self, key: &str, value: ParamValue) -> Result<bool> {
        match key {
            "num_io_threads" => self.num_io_threads = want_u64(key, value)? as usize,
            "enable_dns_srv" => self.enable_dns_srv = want_bool(key, value)?,
            "dump_configuration" => self.dump_configuration = want_bool(key, value)?,
            "user_agent_extra" => self.user_agent_extra = Some(want_str(key, value)?),
            "network" => self.network = Some(want_str(key, value)?),
            "dns_nameserver" => self.dns_nameserver = Some(want_str(key, value)?),
            "dns_port" => {
                let port = want_u64(key, value)?;
                let port = u16::try_from(port)
                    .map_err(|_| Error::invalid(format!("{} out of range: {}", key, port)))?;
                self.dns_port = Some(port);
            }
            "ip_protocol" => self.ip_protocol = want_str(key, value)?.parse()?,
            "config_poll_interval" => self.config_poll_interval = Some(want_ms(key, value)?),
            "config_poll_floor" => self.config_poll_floor = Some(want_ms(key, value)?),
            "connect_timeout" => self.timeouts.connect = want_ms(key, value)?,
            "dispatch_timeout" => self.timeouts.dispatch = want_ms(key, value)?,
            "dns_srv_timeout" => self.timeouts.dns_srv = want_ms(key, value)?,
            "management_timeout" => self.timeouts.management = want_ms(key, value)?,
            "query_timeout" => self.timeouts.query = want_ms(key, value)?,
            "resolve_timeout" => self.timeouts.resolve = want_ms(key, value)?,
            "socket_connect_timeout" => self.timeouts.socket_connect = want_ms(key, value)?,
            "trust_only_capella" => self.security.trust_only_capella = want_bool(key, value)?,
            "trust_only_platform" => self.security.trust_only_platform = want_bool(key, value)?,
            "verify_server_certificate" => {
                self.security.verify_server_certificate = want_bool(key, value)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn want_bool(key: &str, value: ParamValue) -> Result<bool> {
    match value {
        ParamValue::Bool(b) => Ok(b),
        other => Err(Error::invalid(format!("{} must be true or false, got '{}'", key, other))),
    }
}

fn want_u64(key: &str, value: ParamValue) -> Result<u64> {
    match value {
        ParamValue::Int(n) => Ok(n),
        other => Err(Error::invalid(format!("{} must be a number, got '{}'", key, other))),
    }
}

fn want_ms(key: &str, value: ParamValue) -> Result<Duration> {
    want_u64(key, value).map(Duration::from_millis)
}

fn want_str(key: &str, value: ParamValue) -> Result<String> {
    match value {
        ParamValue::List(_) => Err(Error::invalid(format!("{} must be given once", key))),
        other => Ok(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
}

impl FromStr for ScanConsistency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_bounded" => Ok(ScanConsistency::NotBounded),
            "request_plus" => Ok(ScanConsistency::RequestPlus),
            other => Err(Error::invalid(format!(
                "scan_consistency must be not_bounded or request_plus, got '{}'",
                other
            ))),
        }
    }
}

/// Options for a single query.
///
/// Parameter values are JSON text and reach the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub statement: String,
    pub database_name: Option<String>,
    pub scope_name: Option<String>,
    pub priority: Option<bool>,
    pub read_only: Option<bool>,
    pub scan_consistency: Option<ScanConsistency>,
    /// Falls back to the cluster's query timeout when unset.
    #[serde(rename = "timeout_ms", with = "duration_ms::option")]
    pub timeout: Option<Duration>,
    pub positional_parameters: Vec<String>,
    pub named_parameters: BTreeMap<String, String>,
    pub raw: BTreeMap<String, String>,
}

impl QueryOptions {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ..Self::default()
        }
    }

    /// Run the statement in `database.scope`.
    pub fn scope(mut self, database: impl Into<String>, scope: impl Into<String>) -> Self {
        self.database_name = Some(database.into());
        self.scope_name = Some(scope.into());
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn positional(mut self, value: serde_json::Value) -> Self {
        self.positional_parameters.push(value.to_string());
        self
    }

    /// Append a positional parameter given as JSON text.
    pub fn positional_json(mut self, json: impl Into<String>) -> Self {
        self.positional_parameters.push(json.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.named_parameters.insert(name.into(), value.to_string());
        self
    }

    pub fn raw(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.raw.insert(key.into(), value.to_string());
        self
    }

    /// Check everything that can be checked before submission.
    pub fn validate(&self) -> Result<()> {
        if self.statement.trim().is_empty() {
            return Err(Error::invalid("statement must not be empty"));
        }

        match (&self.database_name, &self.scope_name) {
            (Some(db), Some(scope)) if db.is_empty() || scope.is_empty() => {
                return Err(Error::invalid("database and scope names must not be empty"));
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(Error::invalid(
                    "database_name and scope_name must be set together",
                ));
            }
            _ => {}
        }

        for (i, value) in self.positional_parameters.iter().enumerate() {
            check_json(&format!("positional parameter {}", i), value)?;
        }
        for (key, value) in &self.named_parameters {
            if key.is_empty() {
                return Err(Error::invalid("named parameter keys must not be empty"));
            }
            check_json(&format!("named parameter '{}'", key), value)?;
        }
        for (key, value) in &self.raw {
            if key.is_empty() {
                return Err(Error::invalid("raw option keys must not be empty"));
            }
            check_json(&format!("raw option '{}'", key), value)?;
        }
        Ok(())
    }
}

fn check_json(what: &str, text: &str) -> Result<()> {
    serde_json::from_str::<serde::de::IgnoredAny>(text)
        .map(|_| ())
        .map_err(|e| Error::invalid(format!("{} is not valid JSON: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connstr;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_cluster_defaults() {
        let opts = ClusterOptions::default();
        assert_eq!(opts.num_io_threads, 1);
        assert!(opts.enable_dns_srv);
        assert!(opts.security.trust_only_capella);
        assert!(opts.security.verify_server_certificate);
        assert_eq!(opts.timeouts.query, Duration::from_secs(600));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let cred = Credential::new("admin", "hunter2");
        let shown = format!("{:?}", cred);
        assert!(shown.contains("admin"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(cred.allowed_sasl_mechanisms, vec!["PLAIN".to_string()]);
    }

    #[test]
    fn test_user_agent() {
        let opts = ClusterOptions::new();
        assert!(opts.user_agent().starts_with("columnar-bridge/"));
        let opts = opts.user_agent_extra("colq");
        assert!(opts.user_agent().ends_with(";colq"));
    }

    #[test]
    fn test_security_validation() {
        assert!(SecurityOptions::trust_only_capella().validate().is_ok());
        assert!(SecurityOptions::trust_only_pem_str("---").validate().is_ok());
        assert!(SecurityOptions::trust_only_platform().validate().is_ok());

        let mixed = SecurityOptions {
            trust_only_pem_file: Some("/etc/ca.pem".into()),
            ..SecurityOptions::default()
        };
        assert!(mixed.validate().is_err());

        let two = SecurityOptions {
            trust_only_platform: true,
            ..SecurityOptions::trust_only_certificates(vec!["cert".into()])
        };
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_zero_io_threads_invalid() {
        let err = ClusterOptions::new().num_io_threads(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_apply_params() {
        let mut cs = connstr::parse(
            "couchbases://host?num_io_threads=3&enable_dns_srv=false&query_timeout=5000&ip_protocol=force_ipv4&mystery=1",
        )
        .unwrap();
        let mut opts = ClusterOptions::default();
        opts.apply_params(&mut cs).unwrap();

        assert_eq!(opts.num_io_threads, 3);
        assert!(!opts.enable_dns_srv);
        assert_eq!(opts.timeouts.query, Duration::from_millis(5000));
        assert_eq!(opts.ip_protocol, IpProtocol::ForceIpv4);
        assert!(cs.params.is_empty());
    }

    #[test]
    fn test_apply_params_keeps_unknown_when_allowed() {
        let mut cs =
            connstr::parse("couchbases://host?allow_unknown_params=true&mystery=1").unwrap();
        let mut opts = ClusterOptions::default();
        opts.apply_params(&mut cs).unwrap();
        assert!(opts.allow_unknown_params);
        assert_eq!(cs.param("mystery"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_apply_params_type_mismatch() {
        let mut cs = connstr::parse("couchbases://host?enable_dns_srv=maybe").unwrap();
        let err = ClusterOptions::default().apply_params(&mut cs).unwrap_err();
        assert!(err.to_string().contains("enable_dns_srv"));
    }

    #[test]
    fn test_cluster_options_from_toml() {
        let opts: ClusterOptions = toml::from_str(
            r#"
            num_io_threads = 4
            user_agent_extra = "etl"

            [timeouts]
            query_timeout_ms = 1500

            [security]
            trust_only_capella = false
            trust_only_platform = true
            "#,
        )
        .unwrap();
        assert_eq!(opts.num_io_threads, 4);
        assert_eq!(opts.timeouts.query, Duration::from_millis(1500));
        assert_eq!(opts.timeouts.connect, Duration::from_secs(10));
        assert!(opts.security.verify_server_certificate);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_query_options_builder() {
        let opts = QueryOptions::new("SELECT $1")
            .scope("travel", "inventory")
            .positional(json!(42))
            .named("$city", json!("Paris"))
            .raw("query_context", json!("default:travel.inventory"))
            .scan_consistency(ScanConsistency::RequestPlus)
            .read_only(true)
            .timeout(Duration::from_secs(3));

        assert_eq!(opts.positional_parameters, vec!["42".to_string()]);
        assert_eq!(opts.named_parameters["$city"], "\"Paris\"");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_query_options_validation() {
        assert!(QueryOptions::new("  ").validate().is_err());
        assert!(
            QueryOptions::new("SELECT 1")
                .positional_json("{not json")
                .validate()
                .is_err()
        );

        let mut missing_db = QueryOptions::new("SELECT 1");
        missing_db.scope_name = Some("inventory".into());
        assert!(missing_db.validate().is_err());

        let mut empty_key = QueryOptions::new("SELECT 1");
        empty_key.raw.insert(String::new(), "1".into());
        assert!(empty_key.validate().is_err());

        let mut empty_named = QueryOptions::new("SELECT 1");
        empty_named.named_parameters.insert(String::new(), "1".into());
        assert!(empty_named.validate().is_err());
    }

    #[test]
    fn test_scan_consistency_parse() {
        assert_eq!(
            "request_plus".parse::<ScanConsistency>().unwrap(),
            ScanConsistency::RequestPlus
        );
        assert!("eventual".parse::<ScanConsistency>().is_err());
    }
}
