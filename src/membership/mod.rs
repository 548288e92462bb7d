//! Membership & Discovery Module
//!
//! Gossip-based membership (SWIM-like) over UDP, giving the replicated
//! backend its view of which nodes are alive. Each peer advertises two
//! addresses: the UDP gossip socket and the HTTP socket the coordination
//! endpoints listen on.
//!
//! ## Core Mechanisms
//! - **Gossip**: peers periodically ping a random alive peer; the ack
//!   carries the full membership view, which is merged by incarnation.
//! - **Failure Detection**: silence moves a peer Alive -> Suspect -> Dead
//!   on configured timeouts; a suspected peer refutes by bumping its own
//!   incarnation and broadcasting Alive.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
