//! Network layer: TLS connection establishment and control framing

pub mod framer;
pub mod tls;
