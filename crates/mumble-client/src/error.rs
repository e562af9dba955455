use std::io;

use mumble_proto::msgs::RejectType;

/// Failures surfaced by [`crate::dial_with_dialer`] and the [`crate::Client`] handle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("server rejected connection ({kind}): {reason}")]
    Rejected { kind: RejectType, reason: String },

    #[error("timed out waiting for the server to finish the handshake")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

impl ClientError {
    pub(crate) fn rejected(kind: RejectType, reason: Option<String>) -> Self {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| kind.to_string());
        ClientError::Rejected { kind, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_falls_back_to_kind_text() {
        let err = ClientError::rejected(RejectType::ServerFull, Some("  ".to_string()));
        assert_eq!(err.to_string(), "server rejected connection (server full): server full");
    }

    #[test]
    fn rejected_keeps_server_reason() {
        let err = ClientError::rejected(RejectType::WrongUserPassword, Some("bad pw".to_string()));
        assert_eq!(
            err.to_string(),
            "server rejected connection (wrong user password): bad pw"
        );
    }
}
