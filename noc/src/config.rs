// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Error;
use crate::Cycles;

/// A default datapath width, in bits.
pub const BIT_WIDTH: u32 = 128;

/// Routing algorithm selector for the per-router routing unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum RoutingAlgorithm {
    /// Weighted routing-table lookup (the default).
    Table,
    /// Dimension-ordered X-then-Y routing on a 2D mesh.
    Xy,
    /// Placeholder for an externally provided algorithm.
    Custom,
    /// Minimal adaptive, scored by downstream free credits.
    Adaptive,
    /// Minimal adaptive with an EWMA congestion estimate and sticky choices.
    Car3d,
    /// UGAL-L: minimal vs. one non-minimal first hop, decided at the source.
    Ugal,
}

/// Euler-tour labels of the escape spanning tree, indexed by router id.
///
/// A router's subtree covers the half-open interval `[tin, tout)`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EulerLabels {
    pub tin: Vec<usize>,
    pub tout: Vec<usize>,
}

/// All parameters recognized by the router core, plus the topology metadata
/// the routing unit consumes (mesh dimensions, escape-tree labels).
///
/// Constructed programmatically or read from a YAML config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub num_vnets: usize,
    pub vcs_per_vnet: usize,
    /// Buffer slots (credits) per virtual channel.
    pub buffer_depth: usize,
    pub bit_width: u32,
    /// Cycles a flit waits in the input buffer before switch allocation.
    pub pipe_stages: Cycles,
    /// Traversal latency of inter-router links.
    pub link_latency: Cycles,
    pub routing_algorithm: RoutingAlgorithm,
    /// Point-to-point ordering requirement, per vnet.
    pub ordered_vnets: Vec<bool>,
    /// Reserve VC offset 0 of every vnet as an escape VC.
    pub escape_vc_enabled: bool,
    /// Enable probe-based deadlock detection and recovery.
    pub spin_scheme_enabled: bool,
    /// Stall cycles before a VC freezes and the detection counter fires.
    pub dd_threshold: u32,
    /// Longest dependency path a probe may accumulate before it is dropped.
    pub spin_max_turn_capacity: u32,
    pub num_rows: usize,
    pub num_cols: usize,
    #[serde(default)]
    pub euler: EulerLabels,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_vnets: 1,
            vcs_per_vnet: 4,
            buffer_depth: 4,
            bit_width: BIT_WIDTH,
            pipe_stages: 1,
            link_latency: 1,
            routing_algorithm: RoutingAlgorithm::Table,
            ordered_vnets: vec![false],
            escape_vc_enabled: false,
            spin_scheme_enabled: false,
            dd_threshold: 16,
            spin_max_turn_capacity: 12,
            num_rows: 0,
            num_cols: 0,
            euler: EulerLabels::default(),
        }
    }
}

impl NetworkConfig {
    pub fn num_vcs(&self) -> usize {
        self.num_vnets * self.vcs_per_vnet
    }

    pub fn is_vnet_ordered(&self, vnet: usize) -> bool {
        self.ordered_vnets.get(vnet).copied().unwrap_or(false)
    }

    pub fn tin_of(&self, router: usize) -> usize {
        self.euler.tin[router]
    }

    pub fn tout_of(&self, router: usize) -> usize {
        self.euler.tout[router]
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_vnets == 0 || self.vcs_per_vnet == 0 {
            return Err(Error::InvalidConfig(String::from(
                "need at least one vnet and one VC per vnet",
            )));
        }
        if self.buffer_depth == 0 {
            return Err(Error::InvalidConfig(String::from(
                "buffer depth must be at least one slot",
            )));
        }
        if self.pipe_stages == 0 {
            return Err(Error::InvalidConfig(String::from(
                "routers need at least one pipeline stage",
            )));
        }
        if self.ordered_vnets.len() != self.num_vnets {
            return Err(Error::InvalidConfig(format!(
                "ordered_vnets has {} entries for {} vnets",
                self.ordered_vnets.len(),
                self.num_vnets
            )));
        }
        if self.escape_vc_enabled && self.vcs_per_vnet < 2 {
            return Err(Error::InvalidConfig(String::from(
                "escape VCs reserve offset 0; need vcs_per_vnet >= 2",
            )));
        }
        Ok(())
    }

    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }

    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_yaml_config() {
        let conf_str = "---
num_vnets: 2
vcs_per_vnet: 4
buffer_depth: 4
bit_width: 128
pipe_stages: 1
link_latency: 1
routing_algorithm: Xy
ordered_vnets: [true, false]
escape_vc_enabled: true
spin_scheme_enabled: false
dd_threshold: 16
spin_max_turn_capacity: 12
num_rows: 2
num_cols: 2
";
        let config = NetworkConfig::from_str(conf_str);
        assert_eq!(config.num_vnets, 2);
        assert_eq!(config.vcs_per_vnet, 4);
        assert_eq!(config.num_vcs(), 8);
        assert_eq!(config.routing_algorithm, RoutingAlgorithm::Xy);
        assert!(config.is_vnet_ordered(0));
        assert!(!config.is_vnet_ordered(1));
        assert!(config.escape_vc_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn write_yaml_config() {
        let config = NetworkConfig {
            num_vnets: 2,
            ordered_vnets: vec![false, false],
            ..Default::default()
        };
        let text = serde_yaml::to_string(&config).unwrap();
        let back = NetworkConfig::from_str(&text);
        assert_eq!(back.num_vnets, 2);
        assert_eq!(back.buffer_depth, config.buffer_depth);
    }

    #[test]
    fn validation_catches_bad_shapes() {
        let mut config = NetworkConfig::default();
        config.ordered_vnets.clear();
        assert!(config.validate().is_err());

        let config = NetworkConfig {
            escape_vc_enabled: true,
            vcs_per_vnet: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
