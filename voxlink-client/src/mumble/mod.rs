//! Mumble protocol engine
//!
//! The connection state machine, roster, crypto setup, voice packet
//! ingress/egress, and the UDP pinger that decides how voice leaves the
//! client.

pub mod client;
pub mod types;
pub mod udp;
