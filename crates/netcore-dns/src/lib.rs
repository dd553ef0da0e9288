//! netcore DNS service.
//!
//! Authoritative answers come straight from the shared store; questions for
//! names outside our zones are forwarded upstream. Between the wire and the
//! resolver sits a proactive cache that coalesces concurrent misses and
//! refreshes hot entries before they expire.

pub mod cache;
pub mod entry;
pub mod forwarder;
pub mod resolver;
pub mod server;

pub use cache::{DnsCache, Event, LookupContext, Resolve};
pub use entry::{Question, RecordEntry, RecordValue};
pub use forwarder::parse_forwarders;
pub use resolver::{Resolver, ResolverConfig};
pub use server::{DnsHandler, DnsServer};
