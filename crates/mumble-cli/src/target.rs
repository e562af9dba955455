//! Server URL decomposition: `scheme://[user[:pass]@]host[:port][/channel/subchannel...]`.

use std::borrow::Cow;

use mumble_proto::DEFAULT_PORT;
use url::{Host, Url};

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid url {input:?}: {source}")]
    Parse {
        input: String,
        #[source]
        source: url::ParseError,
    },

    #[error("url has no host: {0:?}")]
    MissingHost(String),
}

/// Where to connect, as whom, and which channel to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    /// Hostname or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Channel names from the root; empty means stay in the default channel.
    pub channel_path: Vec<String>,
}

impl ServerTarget {
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let url = Url::parse(input).map_err(|source| TargetError::Parse {
            input: input.to_string(),
            source,
        })?;
        if url.scheme() != "mumble" {
            tracing::warn!(scheme = url.scheme(), "url scheme is not mumble; connecting anyway");
        }

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => percent_decode(d).into_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(TargetError::MissingHost(input.to_string())),
        };

        let username = Some(percent_decode(url.username()).into_owned()).filter(|u| !u.is_empty());
        let password = url.password().map(|p| percent_decode(p).into_owned());
        // Decoded before splitting, so an escaped `/` separates channels too.
        let path = percent_decode(url.path());
        let channel_path = filter_empty(path.split('/'));

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            channel_path,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Drop empty segments, keeping the order of the rest.
pub fn filter_empty<I, S>(segments: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .filter(|s| !s.as_ref().is_empty())
        .map(|s| s.as_ref().to_string())
        .collect()
}

fn percent_decode(s: &str) -> Cow<'_, str> {
    match urlencoding::decode_binary(s.as_bytes()) {
        Cow::Borrowed(_) => Cow::Borrowed(s),
        Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
    }
}
