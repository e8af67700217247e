//! Connection string parser using nom.
//!
//! ```text
//! couchbases://node1.example.com,node2.example.com:18095,[::1]:18095/?timeout=2000&enable_dns_srv=false
//! ─────┬────   ─────────────────────────┬──────────────────────────   ──────────────┬─────────────────
//!      │                                │                                          │
//!      │                                │                                          └── Params (typed values)
//!      │                                └── Hosts (hostname, IPv4 or [IPv6], optional port)
//!      └── Scheme (must be couchbases)
//! ```
//!
//! Parameter values are typed the way they read: all-digit values become
//! integers, `true`/`false` (any case) become booleans, and a key repeated
//! more than once collects its raw values into a list. Empty values are
//! dropped.

use std::collections::BTreeMap;
use std::fmt;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt},
    multi::separated_list1,
    sequence::{delimited, pair, preceded},
};
use serde::Serialize;

use crate::error::{Error, Result};

pub const SCHEME: &str = "couchbases";

/// One seed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSpec {
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// A typed query-string value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(u64),
    Str(String),
    List(Vec<String>),
}

impl ParamValue {
    fn from_raw(mut raw: Vec<String>) -> Self {
        if raw.len() > 1 {
            return ParamValue::List(raw);
        }
        let v = raw.pop().unwrap_or_default();
        if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = v.parse() {
                return ParamValue::Int(n);
            }
        }
        match v.to_ascii_lowercase().as_str() {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Str(v),
        }
    }

    fn raw_values(&self) -> Vec<String> {
        match self {
            ParamValue::Bool(b) => vec![b.to_string()],
            ParamValue::Int(n) => vec![n.to_string()],
            ParamValue::Str(s) => vec![s.clone()],
            ParamValue::List(items) => items.clone(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::List(items) => write!(f, "[{}]", items.join(", ")),
            other => f.write_str(&other.raw_values().join("")),
        }
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionString {
    pub scheme: String,
    pub hosts: Vec<HostSpec>,
    pub params: BTreeMap<String, ParamValue>,
}

impl ConnectionString {
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Remove and return a parameter.
    pub fn take_param(&mut self, key: &str) -> Option<ParamValue> {
        self.params.remove(key)
    }

    /// The connection string without its parameters.
    pub fn base(&self) -> String {
        let hosts: Vec<String> = self.hosts.iter().map(|h| h.to_string()).collect();
        format!("{}://{}", self.scheme, hosts.join(","))
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())?;
        let mut sep = '?';
        for (key, value) in &self.params {
            for raw in value.raw_values() {
                write!(f, "{}{}={}", sep, percent_encode(key), percent_encode(&raw))?;
                sep = '&';
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse a complete connection string.
pub fn parse(input: &str) -> Result<ConnectionString> {
    let input = input.trim();

    let (scheme, hosts, pairs) = match parse_connstr(input) {
        Ok(("", parsed)) => parsed,
        Ok((remaining, _)) => {
            return Err(Error::connstr(
                input.len() - remaining.len(),
                format!("Unexpected trailing content: '{}'", remaining),
            ));
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(Error::connstr(
                input.len() - e.input.len(),
                format!("Parse failed: {:?}", e.code),
            ));
        }
        Err(nom::Err::Incomplete(_)) => {
            return Err(Error::connstr(input.len(), "Unexpected end of input"));
        }
    };

    if scheme != SCHEME {
        return Err(Error::connstr(
            0,
            format!("The connection scheme must be '{}'. Found: {}", SCHEME, scheme),
        ));
    }

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        let value = percent_decode(value);
        if value.is_empty() {
            continue;
        }
        grouped.entry(percent_decode(key)).or_default().push(value);
    }

    Ok(ConnectionString {
        scheme: scheme.to_string(),
        hosts,
        params: grouped
            .into_iter()
            .map(|(k, v)| (k, ParamValue::from_raw(v)))
            .collect(),
    })
}

type Parsed<'a> = (&'a str, Vec<HostSpec>, Vec<(&'a str, &'a str)>);

fn parse_connstr(input: &str) -> IResult<&str, Parsed<'_>> {
    let (input, scheme) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+')(input)?;
    let (input, _) = tag("://")(input)?;
    let (input, hosts) = separated_list1(char(','), parse_host)(input)?;
    let (input, _) = opt(char('/'))(input)?;
    let (input, pairs) = opt(preceded(char('?'), parse_params))(input)?;
    Ok((input, (scheme, hosts, pairs.unwrap_or_default())))
}

/// Parse one host with an optional port.
fn parse_host(input: &str) -> IResult<&str, HostSpec> {
    map(
        pair(alt((parse_ipv6, parse_hostname)), opt(preceded(char(':'), parse_port))),
        |(host, port)| HostSpec {
            host: host.to_string(),
            port,
        },
    )(input)
}

/// Parse a bracketed IPv6 literal, returning it without brackets.
fn parse_ipv6(input: &str) -> IResult<&str, &str> {
    delimited(
        char('['),
        take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
        char(']'),
    )(input)
}

/// Parse a hostname or IPv4 address.
fn parse_hostname(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')(input)
}

fn parse_port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse)(input)
}

/// Parse `k=v&k=v`. Empty segments are skipped.
fn parse_params(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    let (input, segments) = separated_list1(char('&'), opt(parse_pair))(input)?;
    Ok((input, segments.into_iter().flatten().collect()))
}

fn parse_pair(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, key) = take_while1(|c: char| c != '=' && c != '&')(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = take_while(|c: char| c != '&')(input)?;
    Ok((input, (key, value)))
}

/// Escape everything `parse` would read as structure (`&`, `=`, `%`, `+`,
/// `#`, `?`), whitespace and non-ASCII bytes.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~:/,".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Decode `%XX` escapes and `+` as space.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_host() {
        let cs = parse("couchbases://cb.example.com").unwrap();
        assert_eq!(cs.scheme, "couchbases");
        assert_eq!(
            cs.hosts,
            vec![HostSpec {
                host: "cb.example.com".to_string(),
                port: None
            }]
        );
        assert!(cs.params.is_empty());
    }

    #[test]
    fn test_multiple_hosts_and_ports() {
        let cs = parse("couchbases://10.0.0.1:18095,node-2.local,[fe80::1]:443/").unwrap();
        assert_eq!(cs.hosts.len(), 3);
        assert_eq!(cs.hosts[0].port, Some(18095));
        assert_eq!(cs.hosts[1].host, "node-2.local");
        assert_eq!(cs.hosts[2].host, "fe80::1");
        assert_eq!(cs.hosts[2].port, Some(443));
        assert_eq!(cs.base(), "couchbases://10.0.0.1:18095,node-2.local,[fe80::1]:443");
    }

    #[test]
    fn test_typed_params() {
        let cs = parse(
            "couchbases://host?timeout=2500&enable_dns_srv=FALSE&network=external&ca=a&ca=b&blank=",
        )
        .unwrap();
        assert_eq!(cs.param("timeout"), Some(&ParamValue::Int(2500)));
        assert_eq!(cs.param("enable_dns_srv"), Some(&ParamValue::Bool(false)));
        assert_eq!(
            cs.param("network"),
            Some(&ParamValue::Str("external".to_string()))
        );
        assert_eq!(
            cs.param("ca"),
            Some(&ParamValue::List(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(cs.param("blank"), None);
    }

    #[test]
    fn test_negative_number_stays_string() {
        let cs = parse("couchbases://host?dns_port=-1").unwrap();
        assert_eq!(cs.param("dns_port"), Some(&ParamValue::Str("-1".to_string())));
    }

    #[test]
    fn test_percent_decoding() {
        let cs = parse("couchbases://host?user_agent_extra=my%20app+v2").unwrap();
        assert_eq!(
            cs.param("user_agent_extra"),
            Some(&ParamValue::Str("my app v2".to_string()))
        );
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_display_round_trip() {
        let text = "couchbases://a:1,b?x=1&y=true";
        let cs = parse(text).unwrap();
        assert_eq!(cs.to_string(), text);
        assert_eq!(parse(&cs.to_string()).unwrap(), cs);
    }

    #[test]
    fn test_display_escapes_reserved_characters() {
        let cs = parse("couchbases://h?x=a%26b&note=50%25+off&who=caf%C3%A9&k%3D1=v").unwrap();
        assert_eq!(cs.param("x"), Some(&ParamValue::Str("a&b".into())));
        assert_eq!(cs.param("note"), Some(&ParamValue::Str("50% off".into())));
        assert_eq!(cs.param("k=1"), Some(&ParamValue::Str("v".into())));

        let text = cs.to_string();
        assert_eq!(
            text,
            "couchbases://h?k%3D1=v&note=50%25%20off&who=caf%C3%A9&x=a%26b"
        );
        assert_eq!(parse(&text).unwrap(), cs);
    }

    #[test]
    fn test_wrong_scheme() {
        let err = parse("couchbase://host").unwrap_err();
        assert!(err.to_string().contains("must be 'couchbases'"));
    }

    #[test]
    fn test_missing_host() {
        let err = parse("couchbases://").unwrap_err();
        match err {
            Error::ConnectionString { position, .. } => assert_eq!(position, 13),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_trailing_garbage() {
        let err = parse("couchbases://host:notaport").unwrap_err();
        assert!(matches!(err, Error::ConnectionString { position: 17, .. }));
    }
}
