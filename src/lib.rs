//! Cluster-Shared Session State Library
//!
//! This library crate defines the modules that make up the coordination layer
//! of a small multiplayer session server. It is the foundation for the node
//! binary (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems:
//!
//! - **`coordination`**: The shared contracts (`SharedMap`, `SharedLock`,
//!   `SharedCounter`) plus the in-process backend. Everything above speaks
//!   these traits, never a concrete backend.
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based
//!   Gossip protocol (SWIM-like) to manage node discovery, failure detection,
//!   and cluster topology.
//! - **`replicated`**: The replicated in-memory backend. Routes every key to
//!   a primary owner via partitioning, replicates to backups, and sweeps
//!   expired entries cluster-wide.
//! - **`external`**: A client adapter for a network-attached replicated store
//!   speaking an HTTP/JSON protocol that mirrors the contracts one-for-one.
//! - **`expiry`**: The notification bridge that multiplexes a backend's
//!   native expiry feed to any number of in-process subscribers.
//! - **`session`**: HTTP-session replication with optimistic-concurrency
//!   versioning, built entirely on `SharedMap`.
//! - **`game`**: The consumer surfaces the game layer plugs into: the lobby
//!   repository and the expiry-to-domain event glue.

pub mod config;
pub mod coordination;
pub mod expiry;
pub mod external;
pub mod game;
pub mod membership;
pub mod replicated;
pub mod session;
