//! Wire types for DNS messages (RFC 1035) as used by Multicast DNS (RFC
//! 6762) and DNS-Based Service Discovery (RFC 6763).
//!
//! This crate only understands the record types mDNS/DNS-SD actually put on
//! the wire: A, AAAA, PTR, TXT, SRV, and the restricted (type-bitmap ≤ 255)
//! form of NSEC used to assert non-existence. Everything else round-trips as
//! opaque RDATA.

pub mod protocol;
