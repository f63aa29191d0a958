/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted
//! into network addresses (typically IP addresses) used by the channel to
//! connect to a service.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::attributes::Attributes;
use crate::client::service_config::ServiceConfig;

mod registry;
pub use registry::global_registry;

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel
/// creation by the user.  gRPC passes it to the resolver and the balancer.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Returns either host:port or host depending on the existence of the
    /// port in the authority.
    pub fn authority_host_port(&self) -> String {
        let host = self.authority_host();
        match self.authority_port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Retrieves the endpoint from the target's path.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme(),
            self.authority_host_port(),
            self.path()
        )
    }
}

/// A name resolver factory that produces Resolver instances used by the
/// channel to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// Note that build must not fail.  Instead, an erroring Resolver may be
    /// returned that reports an Err value to the listener.
    fn build(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        options: ResolverOptions,
    ) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &'static str;

    /// Returns the default authority for a channel using this name resolver
    /// and target.  This refers to the *dataplane authority* — the value
    /// used in the `:authority` header of HTTP/2 requests — not the
    /// authority portion of the target URI, which typically names an
    /// external server used for name resolution.
    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        path.strip_prefix("/").unwrap_or(path).to_string()
    }

    /// Returns a bool indicating whether the input target is valid to
    /// create a resolver.
    fn is_valid_uri(&self, target: &Target) -> bool;
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
#[derive(Default)]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,
}

/// Watches for updates on the specified target.  Updates include address
/// updates and service config updates, delivered to the listener the
/// resolver was built with.  Dropping the resolver stops the watch; no
/// listener calls may be made afterwards.
pub trait Resolver: Send + Sync {
    /// Asks the resolver to obtain an updated resolver result, if
    /// applicable.
    ///
    /// This is useful for polling resolvers to decide when to re-resolve.
    /// However, the implementation is not required to re-resolve
    /// immediately upon receiving this call; it may instead elect to delay
    /// based on some configured minimum time between queries, to avoid
    /// hammering the name service with queries.
    ///
    /// For watch-based resolvers, this may be a no-op.
    fn resolve_now(&mut self);
}

/// The channel's view of resolver output.  Calls are serialized by the
/// channel; the resolver never observes two concurrent deliveries.
pub trait ResolverListener: Send + Sync {
    /// Delivers the current state of the name resolver.  If an error value
    /// is returned, the name resolver should attempt to re-resolve, if
    /// possible.  The resolver is responsible for applying an appropriate
    /// backoff mechanism to avoid overloading the system or the remote
    /// name service.
    fn on_update(&self, update: ResolverUpdate) -> Result<(), String>;
}

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// Arbitrary data about the resolution intended for consumption by the
    /// load balancing policy.
    pub attributes: Attributes,

    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI.
    pub endpoints: Result<Vec<Endpoint>, String>,

    /// The service config which the client should use for communicating
    /// with the service.  None indicates no service config is present or
    /// the resolver does not provide service configs.
    pub service_config: Result<Option<ServiceConfig>, String>,

    /// An optional human-readable note describing context about the
    /// resolution, to be included in RPC failure status messages when
    /// neither endpoints nor service_config carries an error.  For example,
    /// a resolver that returns an empty endpoint list but a valid service
    /// config may set this to something like "no DNS entries found for
    /// <name>".
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            attributes: Default::default(),
            endpoints: Ok(Default::default()),
            service_config: Ok(None),
            resolution_note: None,
        }
    }
}

/// An Endpoint is an address or a collection of addresses which reference
/// one logical server.  Multiple addresses may be used if there are
/// multiple ways which the server can be reached, e.g. via IPv4 and IPv6
/// addresses.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct Endpoint {
    /// The ordered list of addresses used to access this endpoint.
    pub addresses: Vec<Address>,

    /// Arbitrary data about this endpoint intended for consumption by the
    /// LB policy.
    pub attributes: Attributes,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            attributes: Attributes::new(),
        }
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

/// An Address is an identifier that indicates how to connect to a server.
///
/// Equality, ordering, and hashing consider the network type and the
/// address only; the attribute bag is carried along but never participates
/// in address diffing.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Address {
    /// The network type identifies what kind of transport to create when
    /// connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself, passed verbatim to the transport.
    pub address: String,

    /// Arbitrary data about this address intended for consumption by the
    /// subchannel and LB policies.
    pub attributes: Attributes,
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.network_type, &self.address).cmp(&(other.network_type, &other.address))
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be
/// connected to via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";
