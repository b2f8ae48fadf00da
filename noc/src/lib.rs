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

//! Cycle-accurate model of a network of credit-based virtual-channel
//! wormhole routers.
//!
//! The router pipeline is the heart of the crate: per simulated tick a
//! router ingests flits from its input links, ingests credits on its output
//! links, runs a two-stage separable switch allocation and hands granted
//! flits to the crossbar, which drains them onto the outgoing links. The
//! optional SPIN subsystem detects cyclic virtual-channel dependencies with
//! probe flits and resolves them by rotating the trapped packets one hop
//! along the discovered cycle.
//!
//! Routers are ticked by a small discrete-event [`Scheduler`]; links carry
//! flits and credits between components with a minimum delay of one cycle.
//! [`topology::build_mesh`] wires up a complete mesh network with routing
//! tables and the escape spanning tree.

mod allocator;
mod config;
mod crossbar;
mod error;
mod flit;
mod input_unit;
mod link;
mod output_unit;
mod router;
mod routing;
mod sim;
mod spin;
pub mod topology;
mod vc;

/// Simulated time, in ticks. One tick is one router clock cycle.
pub type Tick = u64;
/// A duration, in router clock cycles.
pub type Cycles = u64;

/// Sentinel used for "never" thresholds.
pub(crate) const TICK_INFINITY: Tick = Tick::MAX;

pub use crate::allocator::SwitchAllocator;
pub use crate::config::{EulerLabels, NetworkConfig, RoutingAlgorithm};
pub use crate::crossbar::CrossbarSwitch;
pub use crate::error::Error;
pub use crate::flit::{
    ControlFlit, ControlKind, Credit, DataFlit, DataKind, Flit, FlitBody, FlitStage, NetDest,
    PacketId, RouteInfo,
};
pub use crate::input_unit::InputUnit;
pub use crate::link::{CreditLink, CreditLinkHandle, NetworkLink, NetworkLinkHandle};
pub use crate::output_unit::OutputUnit;
pub use crate::router::{Router, RouterStats};
pub use crate::routing::{PortDirection, RoutingUnit};
pub use crate::sim::{ComponentId, EjectRecord, Network, NetworkInterface, Scheduler};
pub use crate::spin::CounterState;
pub use crate::vc::{VcState, VirtualChannel};
