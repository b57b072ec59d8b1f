//! Connection establishment: handshake, version negotiation and INIT.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::BoltStream;
use crate::error::{ConnectError, ServerFailure};
use crate::messages::{backend, frontend};
use crate::value::Value;

const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(1);

/// Protocol version number, as exchanged during the handshake.
///
/// The client proposes up to four versions in preference order; the server
/// answers with the one it selected, or zero if it supports none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    /// The sentinel the server answers when no proposed version suits it.
    pub const NONE: Self = Self(0);

    const fn new(version: u32) -> Self {
        Self(version)
    }
}

impl From<u32> for ProtocolVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(value: ProtocolVersion) -> Self {
        value.0
    }
}

impl PartialEq<u32> for ProtocolVersion {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialEq<ProtocolVersion> for u32 {
    fn eq(&self, other: &ProtocolVersion) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credentials presented to the server during INIT.
#[derive(Clone)]
pub enum AuthToken {
    /// No authentication.
    None,
    /// Basic authentication with a principal and its credentials.
    Basic {
        principal: String,
        credentials: String,
    },
}

impl AuthToken {
    fn as_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        match self {
            AuthToken::None => {
                map.insert("scheme".to_string(), Value::String("none".into()));
            }
            AuthToken::Basic {
                principal,
                credentials,
            } => {
                map.insert("scheme".to_string(), Value::String("basic".into()));
                map.insert(
                    "principal".to_string(),
                    Value::String(principal.clone()),
                );
                map.insert(
                    "credentials".to_string(),
                    Value::String(credentials.clone()),
                );
            }
        }
        map
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // credentials stay out of debug output
        match self {
            AuthToken::None => write!(f, "AuthToken::None"),
            AuthToken::Basic { principal, .. } => {
                write!(f, "AuthToken::Basic {{ principal: {principal:?} }}")
            }
        }
    }
}

/// Response data from a successful INIT exchange.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// The server identification string (e.g. `Neo4j/3.4.0`), if sent.
    pub server: Option<String>,
    /// All metadata returned by the INIT response.
    pub metadata: HashMap<String, Value>,
}

/// Builder for configuring and establishing connections.
pub struct ConnectionBuilder {
    user_agent: String,
    auth: AuthToken,
}

impl ConnectionBuilder {
    /// Creates a new connection builder.
    ///
    /// Defaults to no authentication and this crate's user agent.
    pub fn new() -> Self {
        Self {
            user_agent: concat!("bolt_stream/", env!("CARGO_PKG_VERSION")).to_string(),
            auth: AuthToken::None,
        }
    }

    /// Sets the user agent sent during INIT.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the authentication token.
    pub fn auth(mut self, auth: AuthToken) -> Self {
        self.auth = auth;
        self
    }

    /// Sets basic authentication with the given principal and credentials.
    pub fn basic_auth(
        self,
        principal: impl Into<String>,
        credentials: impl Into<String>,
    ) -> Self {
        self.auth(AuthToken::Basic {
            principal: principal.into(),
            credentials: credentials.into(),
        })
    }

    fn as_handshake(&self) -> [u8; 20] {
        let mut buf = [0; 20];
        buf[..4].copy_from_slice(frontend::HANDSHAKE_PREAMBLE);
        buf[4..8].copy_from_slice(&u32::from(CURRENT_VERSION).to_be_bytes());
        // the remaining three proposals stay zero
        buf
    }

    /// Establishes a connection with TLS.
    ///
    /// The transport is wrapped before any protocol bytes are exchanged: the
    /// provided async upgrade function performs the TLS handshake (including
    /// certificate verification, e.g. via
    /// [`check_known_hosts`](crate::tofu::check_known_hosts)) and returns the
    /// encrypted stream, over which the protocol handshake then runs.
    pub async fn connect_with_tls<S, T, F, Fut>(
        &self,
        stream: S,
        upgrade_fn: F,
    ) -> Result<(BoltStream<T>, ServerInfo), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let stream = upgrade_fn(stream).await?;
        self.connect(stream).await
    }

    /// Establishes a connection over the provided stream.
    ///
    /// Performs the handshake, negotiates the protocol version and runs the
    /// INIT exchange.
    pub async fn connect<S>(
        &self,
        mut stream: S,
    ) -> Result<(BoltStream<S>, ServerInfo), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&self.as_handshake()).await?;
        stream.flush().await?;

        let mut buf = [0; 4];
        stream.read_exact(&mut buf).await?;
        let selected = ProtocolVersion::from(u32::from_be_bytes(buf));
        if selected == ProtocolVersion::NONE {
            return Err(ConnectError::VersionRejected);
        }
        if selected != CURRENT_VERSION {
            return Err(ConnectError::UnsupportedVersion(selected.into()));
        }
        debug!(version = %selected, "protocol version negotiated");

        let mut conn = BoltStream::from_stream(stream);
        conn.put_init(&self.user_agent, &self.auth.as_map());
        conn.flush().await?;

        let msg = conn.read_message().await?;
        match msg.signature {
            backend::Signature::SUCCESS => {
                let metadata = msg.metadata().cloned().unwrap_or_default();
                let server = metadata
                    .get("server")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok((conn, ServerInfo { server, metadata }))
            }
            backend::Signature::FAILURE => Err(ConnectError::Init(
                ServerFailure::from_metadata(msg.metadata()),
            )),
            sig => Err(format!("unexpected message {sig} during initialization"))?,
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
