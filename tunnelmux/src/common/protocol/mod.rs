// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnel protocol: wire messages, framing, and the handlers relaying real connections
//
// Lifetime of a tunnel:
//
// - (Inbound side)
// - accept a local connection for a port
// - allocate a tunnel ID and announce it with NewTunnel
// - relay local reads as Data, and Data from the peer into the local connection
// - (Outbound side)
// - receive NewTunnel, resolve the port to a Target
// - connect to the target directly (TCP) or through an in-process HTTP proxy
// - relay in both directions until each side has sent its Close

pub mod codec;
pub mod inbound;
pub mod message;
pub mod outbound;
pub mod proxy_http;
pub mod proxy_tcp;
pub mod target;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;
