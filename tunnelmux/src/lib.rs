// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnel multiplexing over a single ordered bidirectional stream
//!
//! Local connections accepted on one end of a [common::session::Session] are
//! carried as tunnels to the other end, which connects each of them to the
//! TCP or HTTP target configured for its port.

pub mod common;
pub mod util;

pub use common::protocol::target::{StaticTargets, Target, TargetOptions, TargetResolver};
pub use common::protocol::tunnel::{CloseCode, PortId, TunnelError, TunnelId};
pub use common::session::{Session, SessionRole};
