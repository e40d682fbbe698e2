//! Connection configuration parsed from a connection URL.
//!
//! ```text
//! http[s]://[user[:pass]@]host[:port][/path][?level=none|weak|strong&timeout=<secs>&disableClusterDiscovery=<bool>][,host[:port]...]
//! ```
//!
//! The first URL carries every option. Anything after a comma is an extra
//! seed peer; only its host and port are used.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::topology::{DEFAULT_PORT, Peer};

/// Per-request timeout when the URL does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read consistency requested from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    /// Any node answers from local state; may be stale.
    None,
    /// The leader answers without a consensus round.
    #[default]
    Weak,
    /// Linearizable read through the consensus log.
    Strong,
}

impl ConsistencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsistencyLevel::None => "none",
            ConsistencyLevel::Weak => "weak",
            ConsistencyLevel::Strong => "strong",
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ConsistencyLevel::None),
            "weak" => Ok(ConsistencyLevel::Weak),
            "strong" => Ok(ConsistencyLevel::Strong),
            _ => Err(Error::InvalidConsistencyLevel(s.to_string())),
        }
    }
}

/// Basic-auth credentials embedded in request URLs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "xxxxx"))
            .finish()
    }
}

/// Everything the connection URL can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub tls: bool,
    pub credentials: Option<Credentials>,
    /// The first host in the URL.
    pub seed: Peer,
    /// Hosts after the first comma.
    pub extra_peers: Vec<Peer>,
    pub level: ConsistencyLevel,
    pub timeout: Duration,
    pub discovery: bool,
}

impl FromStr for ConnectOptions {
    type Err = Error;

    fn from_str(conn_url: &str) -> Result<Self> {
        let mut urls = conn_url.split(',');
        let first = urls.next().unwrap_or_default().trim();
        let mut options = parse_primary(first)?;
        for extra in urls {
            let extra = extra.trim();
            if extra.is_empty() {
                continue;
            }
            options.extra_peers.push(Peer::from_api_addr(extra)?);
        }
        Ok(options)
    }
}

fn parse_primary(raw: &str) -> Result<ConnectOptions> {
    if raw.len() < 7 {
        return Err(Error::InvalidUrl(format!("url is impossibly short: {raw:?}")));
    }
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| Error::InvalidUrl("url has no scheme".into()))?;
    let tls = match scheme.to_ascii_lowercase().as_str() {
        "http" => false,
        "https" => true,
        other => return Err(Error::InvalidUrl(format!("unsupported scheme {other:?}"))),
    };

    // `http://` and `http://?level=strong` mean the local default node.
    let rest = if rest.is_empty() || rest.starts_with(['/', '?']) {
        format!("localhost:{DEFAULT_PORT}{rest}")
    } else {
        rest.to_string()
    };
    let url = Url::parse(&format!("{scheme}://{rest}"))
        .map_err(|err| Error::InvalidUrl(err.to_string()))?;

    let credentials = (!url.username().is_empty()).then(|| Credentials {
        username: decode(url.username()),
        password: url.password().map(decode),
    });

    let host = url.host_str().unwrap_or("localhost");
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let seed = Peer::new(host, url.port().unwrap_or(DEFAULT_PORT));

    let mut options = ConnectOptions {
        tls,
        credentials,
        seed,
        extra_peers: Vec::new(),
        level: ConsistencyLevel::default(),
        timeout: DEFAULT_TIMEOUT,
        discovery: true,
    };

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "level" if value.is_empty() => {}
            "level" => options.level = value.parse()?,
            "timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidUrl(format!("invalid timeout: {value}")))?;
                options.timeout = Duration::from_secs(secs);
            }
            "disableClusterDiscovery" => {
                let disabled: bool = value.parse().map_err(|_| {
                    Error::InvalidUrl(format!("invalid disableClusterDiscovery: {value}"))
                })?;
                options.discovery = !disabled;
            }
            _ => {}
        }
    }

    Ok(options)
}

fn decode(component: &str) -> String {
    urlencoding::decode(component)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| component.to_string())
}
