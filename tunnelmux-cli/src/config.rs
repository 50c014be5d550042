// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Interface configuration: targets this end connects to, and listeners it tunnels from
use std::{collections::HashMap, net::SocketAddr, path::Path};

use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use serde::{Deserialize, Serialize};
use tunnelmux::{util::validators::validate_target_host, PortId, StaticTargets, Target};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
  /// Local address accepting connections
  pub bind: SocketAddr,
  /// Port identifier announced to the peer for each accepted connection
  pub port: PortId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
  /// Where tunnels announced by the peer are connected, keyed by port identifier
  #[serde(default)]
  pub targets: HashMap<PortId, Target>,
  #[serde(default)]
  pub listeners: Vec<ListenerConfig>,
}

impl InterfaceConfig {
  pub fn from_json(json: &str) -> Result<Self> {
    let config: Self = serde_json::from_str(json).context("Invalid interface configuration")?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: &Path) -> Result<Self> {
    let json = std::fs::read_to_string(path)
      .with_context(|| format!("Failed reading configuration file {}", path.display()))?;
    Self::from_json(&json).with_context(|| format!("Failed loading {}", path.display()))
  }

  fn validate(&self) -> Result<()> {
    for (port, target) in self.targets.iter() {
      validate_target_host(&target.host)
        .map_err(AnyErr::msg)
        .with_context(|| format!("Invalid target for port {}", port))?;
    }
    let mut binds = std::collections::HashSet::new();
    for listener in self.listeners.iter() {
      if !binds.insert(listener.bind) {
        return Err(AnyErr::msg(format!(
          "Listener address {} is configured more than once",
          listener.bind
        )));
      }
    }
    Ok(())
  }

  pub fn resolver(&self) -> StaticTargets {
    StaticTargets::from(self.targets.clone())
  }
}
