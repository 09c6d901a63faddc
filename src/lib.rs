//! Tracked Sync
//!
//! Entity replication for real-time multiplayer sessions over TCP + UDP.
//!
//! A server (peer 0) and its clients share tracked entities of four kinds:
//! items, sosigs, auto-meaters and encryptions. Each entity has exactly one
//! controller at a time; everyone else applies its deltas. Entities are only
//! materialized on peers in the same scene and instance.
//!
//! # Layout
//!
//! - `game` - entity records, registries, authority and relevance
//! - `net` - byte codec, framing, dispatch tables, sessions and transport
//! - `config` / `metrics` - environment configuration and the metrics endpoint

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
