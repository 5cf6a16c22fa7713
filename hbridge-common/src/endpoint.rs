//! # Endpoints and Pooling Keys
//!
//! Destination descriptions and the keys sessions are pooled under.
//!
//! ## Design Principles
//!
//! 1. **Immutable Views**: An `Endpoint` is never mutated once parsed; keys are
//!    derived by copying the scheme and authority out of it.
//! 2. **Host Granularity**: `HostKey` keeps scheme, host and port only, so two
//!    endpoints that differ in path, query or fragment share a session.
//! 3. **Ordered Proxy Pairs**: `ProxyKey` is `(proxy, target)`; swapping the
//!    pair yields a different key.
//!
//! ## Key Derivation Example
//!
//! ```text
//! https://api.example.com/v1/items?page=2#top
//!   └── HostKey { scheme: "https", host: "api.example.com", port: 443 }
//!
//! (http://proxy.local:3128, https://api.example.com/v1)
//!   └── ProxyKey { proxy: http://proxy.local:3128, target: https://api.example.com:443 }
//! ```

use std::fmt;

use url::Url;

use crate::error::{BridgeError, BridgeResult};

/// A parsed request destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Endpoint {
    /// Parses an absolute URL into an endpoint.
    ///
    /// # Errors
    /// Returns `BridgeError::InvalidEndpoint` when the URL has no host or its
    /// scheme has no known default port and none was given.
    ///
    /// # Examples
    /// ```rust
    /// use hbridge_common::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("http://example.com/index?q=1").expect("valid url");
    /// assert_eq!(endpoint.port(), 80);
    /// assert_eq!(endpoint.request_target(), "/index?q=1");
    /// ```
    pub fn parse(input: &str) -> BridgeResult<Self> {
        let url = Url::parse(input).map_err(|err| BridgeError::InvalidEndpoint(format!("{input}: {err}")))?;
        Self::from_url(&url)
    }

    /// Builds an endpoint from an already parsed URL.
    pub fn from_url(url: &Url) -> BridgeResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::InvalidEndpoint(format!("{url}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BridgeError::InvalidEndpoint(format!("{url}: missing port")))?;

        Ok(Endpoint {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            fragment: url.fragment().map(str::to_string),
        })
    }

    /// Resolves `reference` against this endpoint, e.g. a request path
    /// against a base URL.
    pub fn join(&self, reference: &str) -> BridgeResult<Self> {
        let base = Url::parse(&self.to_string())
            .map_err(|err| BridgeError::InvalidEndpoint(format!("{self}: {err}")))?;
        let joined = base
            .join(reference)
            .map_err(|err| BridgeError::InvalidEndpoint(format!("{reference}: {err}")))?;
        Self::from_url(&joined)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host as written in the URL; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for socket connects and TLS server names.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Returns true for schemes that require TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Returns the default port for the scheme, if any.
    pub fn default_port(&self) -> Option<u16> {
        match self.scheme.as_str() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        }
    }

    /// Authority for the `host` header: the port is omitted when it is the
    /// scheme default.
    pub fn authority(&self) -> String {
        if self.default_port() == Some(self.port) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Origin-form request target: path plus query, never empty.
    pub fn request_target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        match &self.query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }

    /// Derives the pooling key for this endpoint.
    #[inline]
    pub fn host_key(&self) -> HostKey {
        HostKey::from(self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

/// Pooling key: scheme and authority of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    scheme: String,
    host: String,
    port: u16,
}

impl HostKey {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<&Endpoint> for HostKey {
    fn from(endpoint: &Endpoint) -> Self {
        HostKey {
            scheme: endpoint.scheme.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
        }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Pooling key for a session tunnelled through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyKey {
    pub proxy: HostKey,
    pub target: HostKey,
}

impl ProxyKey {
    pub fn new(proxy: &Endpoint, target: &Endpoint) -> Self {
        ProxyKey {
            proxy: proxy.host_key(),
            target: target.host_key(),
        }
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.target, self.proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_ignores_path_query_and_fragment() {
        let a = Endpoint::parse("http://example.com/a?x=1#top").unwrap();
        let b = Endpoint::parse("http://example.com/b/c").unwrap();
        assert_eq!(a.host_key(), b.host_key());
    }

    #[test]
    fn host_key_distinguishes_scheme_and_port() {
        let plain = Endpoint::parse("http://example.com/").unwrap();
        let tls = Endpoint::parse("https://example.com/").unwrap();
        let other_port = Endpoint::parse("http://example.com:8080/").unwrap();
        assert_ne!(plain.host_key(), tls.host_key());
        assert_ne!(plain.host_key(), other_port.host_key());
    }

    #[test]
    fn explicit_default_port_matches_implicit() {
        let implicit = Endpoint::parse("https://example.com/x").unwrap();
        let explicit = Endpoint::parse("https://example.com:443/y").unwrap();
        assert_eq!(implicit.host_key(), explicit.host_key());
    }

    #[test]
    fn derivation_leaves_endpoint_untouched() {
        let endpoint = Endpoint::parse("http://example.com/index?q=1#f").unwrap();
        let before = endpoint.clone();
        let _ = endpoint.host_key();
        let _ = ProxyKey::new(&endpoint, &endpoint);
        assert_eq!(endpoint, before);
    }

    #[test]
    fn proxy_key_is_ordered() {
        let proxy = Endpoint::parse("http://proxy.local:3128").unwrap();
        let target = Endpoint::parse("http://example.com").unwrap();
        assert_ne!(ProxyKey::new(&proxy, &target), ProxyKey::new(&target, &proxy));
        assert_eq!(ProxyKey::new(&proxy, &target), ProxyKey::new(&proxy, &target));
    }

    #[test]
    fn authority_omits_default_port() {
        let endpoint = Endpoint::parse("http://example.com/").unwrap();
        assert_eq!(endpoint.authority(), "example.com");
        let endpoint = Endpoint::parse("http://127.0.0.1:9000/").unwrap();
        assert_eq!(endpoint.authority(), "127.0.0.1:9000");
    }

    #[test]
    fn request_target_defaults_to_root() {
        let endpoint = Endpoint::parse("https://www.google.com").unwrap();
        assert_eq!(endpoint.request_target(), "/");
        let endpoint = Endpoint::parse("https://www.google.com/search?q=cats").unwrap();
        assert_eq!(endpoint.request_target(), "/search?q=cats");
    }

    #[test]
    fn join_resolves_paths_against_base() {
        let base = Endpoint::parse("http://127.0.0.1:8080").unwrap();
        let joined = base.join("/index").unwrap();
        assert_eq!(joined.path(), "/index");
        assert_eq!(joined.host_key(), base.host_key());
    }

    #[test]
    fn missing_host_is_rejected() {
        assert!(matches!(
            Endpoint::parse("mailto:someone@example.com"),
            Err(BridgeError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn ipv6_connect_host_drops_brackets() {
        let endpoint = Endpoint::parse("http://[::1]:8080/").unwrap();
        assert_eq!(endpoint.host(), "[::1]");
        assert_eq!(endpoint.connect_host(), "::1");
    }
}
