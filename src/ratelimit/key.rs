//! Identity extraction from request context.

use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Identity used when a request carries neither a key nor a client address.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// The parts of an inbound request an identity can be derived from.
///
/// Filled in by the request-dispatch layer: the network layer supplies the
/// client address, the authentication layer the verified claims.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    remote_addr: Option<IpAddr>,
    claims: Option<Value>,
    /// Header names are stored lowercased.
    headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client address.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the client address from a socket address, dropping the port.
    pub fn with_peer(self, peer: SocketAddr) -> Self {
        self.with_remote_addr(peer.ip())
    }

    /// Attach already-verified authentication claims.
    pub fn with_claims(mut self, claims: Value) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn claims(&self) -> Option<&Value> {
        self.claims.as_ref()
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client address as an identity, or empty when unknown.
    pub fn client_ip(&self) -> String {
        self.remote_addr.map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// The authenticated principal, if the claims name one.
    ///
    /// A string claim is the principal itself. An object yields its `id`
    /// field, else its `user_id` field, when that field is a non-empty string.
    pub fn principal(&self) -> Option<&str> {
        let principal = match self.claims.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Object(map) => ["id", "user_id"]
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))?,
            _ => return None,
        };

        (!principal.is_empty()).then_some(principal)
    }
}

/// Maps a request to the identity its bucket is keyed by.
///
/// An empty result means "no key"; the guard then falls back to the client
/// address. Closures `Fn(&RequestContext) -> String` implement this trait.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, ctx: &RequestContext) -> String;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestContext) -> String + Send + Sync,
{
    fn extract(&self, ctx: &RequestContext) -> String {
        self(ctx)
    }
}

/// Built-in key strategies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// Per client network address.
    #[default]
    ClientAddress,
    /// Per authenticated principal, falling back to the client address.
    Principal,
    /// Per value of the named header, falling back to the client address.
    Header { header: String },
}

impl KeyExtractor for KeyStrategy {
    fn extract(&self, ctx: &RequestContext) -> String {
        match self {
            KeyStrategy::ClientAddress => ctx.client_ip(),
            KeyStrategy::Principal => match ctx.principal() {
                Some(principal) => principal.to_owned(),
                None => ctx.client_ip(),
            },
            KeyStrategy::Header { header } => match ctx.header(header) {
                Some(value) if !value.is_empty() => value.to_owned(),
                _ => ctx.client_ip(),
            },
        }
    }
}
