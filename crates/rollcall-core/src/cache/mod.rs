//! Local resource cache for offline reads.
//!
//! `ResourceCache` answers reads for server resources (today's check-ins,
//! the weekly ranking, streaks, parties) without waiting on the network.
//! Entries carry a TTL; expired entries are still served as `Stale` while a
//! single coalesced refresh is requested from the sync coordinator.

pub mod key;
pub mod manager;

pub use key::ResourceKey;
pub use manager::{
    CacheError, CacheRead, CachedData, Freshness, RefreshClaim, RefreshTicket, ResourceCache,
};
