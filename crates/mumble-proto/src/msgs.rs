//! Protobuf control messages (`Mumble.proto`, proto2).
//!
//! Only the messages the client reads or writes are modelled. Field numbers follow the
//! upstream schema; fields the client never touches are left out, which prost skips on decode.

/// Sent by both sides right after the TLS handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Version {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub release: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub os: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub os_version: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Authenticate {
    #[prost(string, optional, tag = "1")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub password: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub tokens: Vec<String>,
    #[prost(int32, repeated, packed = "false", tag = "4")]
    pub celt_versions: Vec<i32>,
    #[prost(bool, optional, tag = "5")]
    pub opus: Option<bool>,
    #[prost(int32, optional, tag = "6")]
    pub client_type: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub good: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub late: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub lost: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub resync: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reject {
    /// See [`RejectType`].
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

/// Reasons a server refuses the `Authenticate` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectType {
    None,
    WrongVersion,
    InvalidUsername,
    WrongUserPassword,
    WrongServerPassword,
    UsernameInUse,
    ServerFull,
    NoCertificate,
    AuthenticatorFail,
    Unknown(i32),
}

impl RejectType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => RejectType::None,
            1 => RejectType::WrongVersion,
            2 => RejectType::InvalidUsername,
            3 => RejectType::WrongUserPassword,
            4 => RejectType::WrongServerPassword,
            5 => RejectType::UsernameInUse,
            6 => RejectType::ServerFull,
            7 => RejectType::NoCertificate,
            8 => RejectType::AuthenticatorFail,
            other => RejectType::Unknown(other),
        }
    }
}

impl std::fmt::Display for RejectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectType::None => "rejected",
            RejectType::WrongVersion => "wrong version",
            RejectType::InvalidUsername => "invalid username",
            RejectType::WrongUserPassword => "wrong user password",
            RejectType::WrongServerPassword => "wrong server password",
            RejectType::UsernameInUse => "username in use",
            RejectType::ServerFull => "server full",
            RejectType::NoCertificate => "certificate required",
            RejectType::AuthenticatorFail => "authenticator failure",
            RejectType::Unknown(v) => return write!(f, "rejected (type {v})"),
        };
        f.write_str(text)
    }
}

impl Reject {
    pub fn reject_type(&self) -> RejectType {
        RejectType::from_i32(self.r#type.unwrap_or(0))
    }
}

/// Final message of the handshake; the client is connected once this arrives.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSync {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub welcome_text: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub permissions: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelRemove {
    #[prost(uint32, required, tag = "1")]
    pub channel_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelState {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub parent: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub links: Vec<u32>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "6")]
    pub links_add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "7")]
    pub links_remove: Vec<u32>,
    #[prost(bool, optional, tag = "8")]
    pub temporary: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub position: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub description_hash: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "11")]
    pub max_users: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserRemove {
    #[prost(uint32, required, tag = "1")]
    pub session: u32,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub ban: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserState {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub user_id: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub channel_id: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub mute: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub deaf: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub suppress: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub self_mute: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub self_deaf: Option<bool>,
    #[prost(string, optional, tag = "14")]
    pub comment: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub hash: Option<String>,
    #[prost(bool, optional, tag = "18")]
    pub priority_speaker: Option<bool>,
    #[prost(bool, optional, tag = "19")]
    pub recording: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TextMessage {
    #[prost(uint32, optional, tag = "1")]
    pub actor: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_id: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub tree_id: Vec<u32>,
    #[prost(string, required, tag = "5")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PermissionDenied {
    #[prost(uint32, optional, tag = "1")]
    pub permission: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub session: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub reason: Option<String>,
    #[prost(int32, optional, tag = "5")]
    pub r#type: Option<i32>,
    #[prost(string, optional, tag = "6")]
    pub name: Option<String>,
}

/// UDP crypto parameters. Voice is tunnelled over TLS, so the client only logs these.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CryptSetup {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub client_nonce: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CodecVersion {
    #[prost(int32, required, tag = "1")]
    pub alpha: i32,
    #[prost(int32, required, tag = "2")]
    pub beta: i32,
    #[prost(bool, required, tag = "3")]
    pub prefer_alpha: bool,
    #[prost(bool, optional, tag = "4")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerConfig {
    #[prost(uint32, optional, tag = "1")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub welcome_text: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub allow_html: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub message_length: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub image_message_length: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub max_users: Option<u32>,
}
