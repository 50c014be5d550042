// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Resolution of outbound tunnels to real destinations

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::tunnel::{PortId, TunnelId};

/// How an outbound connection to a [Target] is established
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOptions {
  /// Dial the host directly and relay raw bytes instead of proxying HTTP
  pub tcp: bool,
  /// Value for `Access-Control-Allow-Origin` on proxied HTTP responses
  pub cors_allow_origin: Option<String>,
  /// Rewrite the `Host` header to the target host instead of preserving it
  pub change_origin: bool,
  /// Extra request headers injected into proxied HTTP requests
  pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
  /// `host:port` of the real destination
  pub host: String,
  #[serde(default)]
  pub options: TargetOptions,
}

impl Target {
  pub fn tcp(host: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      options: TargetOptions {
        tcp: true,
        ..Default::default()
      },
    }
  }

  pub fn http(host: impl Into<String>, options: TargetOptions) -> Self {
    Self {
      host: host.into(),
      options: TargetOptions {
        tcp: false,
        ..options
      },
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
  #[error("No target is configured for port {0}")]
  NotFound(PortId),
}

/// Supplies the destination of each outbound tunnel
#[cfg_attr(test, mockall::automock)]
pub trait TargetResolver: Send + Sync {
  fn resolve(&self, tunnel_id: TunnelId, port: PortId) -> Result<Target, ResolveError>;
}

/// Resolver backed by a fixed port-to-target table
#[derive(Debug, Clone, Default)]
pub struct StaticTargets {
  targets: HashMap<PortId, Target>,
}

impl StaticTargets {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_target(mut self, port: PortId, target: Target) -> Self {
    self.insert(port, target);
    self
  }

  pub fn insert(&mut self, port: PortId, target: Target) -> Option<Target> {
    self.targets.insert(port, target)
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }
}

impl From<HashMap<PortId, Target>> for StaticTargets {
  fn from(targets: HashMap<PortId, Target>) -> Self {
    Self { targets }
  }
}

impl FromIterator<(PortId, Target)> for StaticTargets {
  fn from_iter<T: IntoIterator<Item = (PortId, Target)>>(iter: T) -> Self {
    Self {
      targets: iter.into_iter().collect(),
    }
  }
}

impl TargetResolver for StaticTargets {
  fn resolve(&self, _tunnel_id: TunnelId, port: PortId) -> Result<Target, ResolveError> {
    self
      .targets
      .get(&port)
      .cloned()
      .ok_or(ResolveError::NotFound(port))
  }
}
