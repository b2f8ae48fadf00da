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

//! Per-router route computation.
//!
//! The routing unit is consulted once per HEAD flit. It owns the routing
//! and weight tables installed at wiring time, the escape spanning-tree
//! shape, and the mutable selection state the adaptive variants need
//! (round-robin pointers, congestion EWMA, sticky last choices). All
//! randomness comes from an injected seeded generator.

use rand::Rng;
use rand_pcg::Pcg64;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::config::{NetworkConfig, RoutingAlgorithm};
use crate::error::Error;
use crate::flit::{NetDest, RouteInfo};
use crate::output_unit::OutputUnit;

const INFINITE_WEIGHT: i32 = 10_000;

/// CAR3D scoring parameters.
const CAR3D_ALPHA: f64 = 1.0;
const CAR3D_BETA: f64 = 0.5;
const CAR3D_EPSILON: f64 = 1e-9;
/// EWMA smoothing factor.
const CAR3D_LAMBDA: f64 = 0.2;

/// Compass orientation of a router port.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PortDirection {
    Local,
    North,
    East,
    South,
    West,
    Up,
    Down,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A child edge of the escape spanning tree, with the Euler-tour interval
/// of the subtree hanging off it.
#[derive(Clone, Debug)]
struct ChildLink {
    outport: usize,
    tin: usize,
    tout: usize,
}

pub struct RoutingUnit {
    router_id: usize,
    cfg: Rc<NetworkConfig>,
    /// `routing_table[vnet][outport]`: destinations reachable minimally.
    routing_table: Vec<Vec<NetDest>>,
    weight_table: Vec<i32>,
    in_dirn: Vec<PortDirection>,
    out_dirn: Vec<PortDirection>,
    outport_by_dirn: HashMap<PortDirection, usize>,
    parent_outport: Option<usize>,
    children: Vec<ChildLink>,
    /// Tie-break pointer per inport for the adaptive variants.
    rr_by_inport: HashMap<usize, usize>,
    /// `ewma[outport][vnet]`: smoothed observed downstream credit.
    ewma: Vec<Vec<f64>>,
    /// Sticky choice per `(inport, vnet, dest_router)`.
    last_choice: HashMap<(usize, usize, usize), usize>,
    rng: Pcg64,
    ugal_min_choices: u64,
    ugal_nonmin_choices: u64,
}

impl RoutingUnit {
    pub fn new(router_id: usize, cfg: Rc<NetworkConfig>, rng: Pcg64) -> Self {
        let num_vnets = cfg.num_vnets;
        Self {
            router_id,
            cfg,
            routing_table: vec![Vec::new(); num_vnets],
            weight_table: Vec::new(),
            in_dirn: Vec::new(),
            out_dirn: Vec::new(),
            outport_by_dirn: HashMap::new(),
            parent_outport: None,
            children: Vec::new(),
            rr_by_inport: HashMap::new(),
            ewma: Vec::new(),
            last_choice: HashMap::new(),
            rng,
            ugal_min_choices: 0,
            ugal_nonmin_choices: 0,
        }
    }

    /// Install the next outport's table entry (one `NetDest` per vnet),
    /// link weight and direction. Ports must be added in index order.
    pub fn add_out_port(&mut self, direction: PortDirection, entry: Vec<NetDest>, weight: i32) {
        assert_eq!(entry.len(), self.cfg.num_vnets);
        let outport = self.weight_table.len();
        for (vnet, dest) in entry.into_iter().enumerate() {
            self.routing_table[vnet].push(dest);
        }
        self.weight_table.push(weight);
        self.out_dirn.push(direction);
        self.outport_by_dirn.entry(direction).or_insert(outport);
        self.ewma.push(vec![0.0; self.cfg.num_vnets]);
    }

    pub fn add_in_port(&mut self, direction: PortDirection) {
        self.in_dirn.push(direction);
    }

    pub fn num_outports(&self) -> usize {
        self.out_dirn.len()
    }

    pub fn out_direction(&self, outport: usize) -> PortDirection {
        self.out_dirn[outport]
    }

    pub fn in_direction(&self, inport: usize) -> PortDirection {
        self.in_dirn[inport]
    }

    pub fn outport_index(&self, direction: PortDirection) -> Option<usize> {
        self.outport_by_dirn.get(&direction).copied()
    }

    pub fn set_parent_outport(&mut self, outport: usize) {
        self.parent_outport = Some(outport);
    }

    pub fn add_child(&mut self, outport: usize, tin: usize, tout: usize) {
        self.children.push(ChildLink { outport, tin, tout });
    }

    pub fn ugal_choices(&self) -> (u64, u64) {
        (self.ugal_min_choices, self.ugal_nonmin_choices)
    }

    /// Route a HEAD flit: local delivery via the table, everything else by
    /// the configured algorithm.
    pub fn outport_compute(
        &mut self,
        route: &RouteInfo,
        inport: usize,
        inport_dirn: PortDirection,
        outputs: &[OutputUnit],
    ) -> Result<usize, Error> {
        if route.dest_router == self.router_id {
            // Several NIs can hang off one router; the table entry for the
            // Local outports tells them apart.
            return self.lookup_routing_table(route.vnet, &route.net_dest);
        }

        match self.cfg.routing_algorithm {
            RoutingAlgorithm::Table => self.lookup_routing_table(route.vnet, &route.net_dest),
            RoutingAlgorithm::Xy => Ok(self.outport_compute_xy(route, inport, inport_dirn)),
            RoutingAlgorithm::Custom => unimplemented!("no custom routing algorithm installed"),
            RoutingAlgorithm::Adaptive => self.outport_compute_adaptive(route, inport, outputs),
            RoutingAlgorithm::Car3d => self.outport_compute_car3d(route, inport, outputs),
            RoutingAlgorithm::Ugal => self.outport_compute_ugal(route, outputs),
        }
    }

    /// Minimum-weight table candidates intersecting the destination set.
    fn min_weight_candidates(&self, vnet: usize, destination: &NetDest) -> Vec<usize> {
        let table = &self.routing_table[vnet];
        let mut min_weight = INFINITE_WEIGHT;
        for (outport, entry) in table.iter().enumerate() {
            if destination.intersects(entry) && self.weight_table[outport] <= min_weight {
                min_weight = self.weight_table[outport];
            }
        }
        table
            .iter()
            .enumerate()
            .filter(|(outport, entry)| {
                destination.intersects(entry) && self.weight_table[*outport] == min_weight
            })
            .map(|(outport, _)| outport)
            .collect()
    }

    /// Default table-based routing. Ordered vnets always take the first
    /// candidate; unordered vnets pick uniformly at random.
    pub fn lookup_routing_table(
        &mut self,
        vnet: usize,
        destination: &NetDest,
    ) -> Result<usize, Error> {
        let candidates = self.min_weight_candidates(vnet, destination);
        if candidates.is_empty() {
            return Err(Error::NoRoute {
                router: self.router_id,
                vnet,
            });
        }
        let chosen = if self.cfg.is_vnet_ordered(vnet) {
            0
        } else {
            self.rng.gen_range(0..candidates.len())
        };
        Ok(candidates[chosen])
    }

    /// Dimension-ordered routing on a 2D mesh, X before Y. The direction
    /// asserts catch misrouted turns.
    fn outport_compute_xy(
        &self,
        route: &RouteInfo,
        _inport: usize,
        inport_dirn: PortDirection,
    ) -> usize {
        let num_cols = self.cfg.num_cols;
        assert!(self.cfg.num_rows > 0 && num_cols > 0);

        let my_x = (self.router_id % num_cols) as isize;
        let my_y = (self.router_id / num_cols) as isize;
        let dest_x = (route.dest_router % num_cols) as isize;
        let dest_y = (route.dest_router / num_cols) as isize;

        let x_hops = (dest_x - my_x).abs();
        let y_hops = (dest_y - my_y).abs();
        assert!(
            x_hops != 0 || y_hops != 0,
            "local delivery handled before dispatch"
        );

        let outport_dirn = if x_hops > 0 {
            if dest_x > my_x {
                assert!(matches!(
                    inport_dirn,
                    PortDirection::Local | PortDirection::West
                ));
                PortDirection::East
            } else {
                assert!(matches!(
                    inport_dirn,
                    PortDirection::Local | PortDirection::East
                ));
                PortDirection::West
            }
        } else if dest_y > my_y {
            assert!(inport_dirn != PortDirection::North);
            PortDirection::North
        } else {
            assert!(inport_dirn != PortDirection::South);
            PortDirection::South
        };

        self.outport_index(outport_dirn)
            .unwrap_or_else(|| panic!("router {} has no {} outport", self.router_id, outport_dirn))
    }

    /// Minimal adaptive: among the min-weight candidates, prefer the one
    /// with the most free downstream credits on this vnet.
    fn outport_compute_adaptive(
        &mut self,
        route: &RouteInfo,
        inport: usize,
        outputs: &[OutputUnit],
    ) -> Result<usize, Error> {
        let vnet = route.vnet;
        let candidates = self.min_weight_candidates(vnet, &route.net_dest);
        if candidates.is_empty() {
            return Err(Error::NoRoute {
                router: self.router_id,
                vnet,
            });
        }
        if candidates.len() == 1 {
            return Ok(candidates[0]);
        }

        let score = |outport: usize| outputs[outport].vnet_credits(vnet);
        let best = candidates.iter().map(|&c| score(c)).max().unwrap();
        let top: Vec<usize> = candidates.into_iter().filter(|&c| score(c) == best).collect();
        if top.len() == 1 {
            return Ok(top[0]);
        }
        Ok(self.round_robin_pick(inport, &top))
    }

    /// CAR3D: credit score blended with a congestion EWMA, sticky per
    /// `(inport, vnet, dest)` so established flows keep their path.
    fn outport_compute_car3d(
        &mut self,
        route: &RouteInfo,
        inport: usize,
        outputs: &[OutputUnit],
    ) -> Result<usize, Error> {
        let vnet = route.vnet;
        let candidates = self.min_weight_candidates(vnet, &route.net_dest);
        if candidates.is_empty() {
            return Err(Error::NoRoute {
                router: self.router_id,
                vnet,
            });
        }
        if candidates.len() == 1 {
            return Ok(candidates[0]);
        }

        let score = |outport: usize| {
            CAR3D_ALPHA * outputs[outport].vnet_credits(vnet) as f64
                + CAR3D_BETA * self.ewma[outport][vnet]
        };
        let best = candidates.iter().map(|&c| score(c)).fold(f64::MIN, f64::max);
        let top: Vec<usize> = candidates
            .into_iter()
            .filter(|&c| score(c) + CAR3D_EPSILON >= best)
            .collect();

        let key = (inport, vnet, route.dest_router);
        if let Some(&last) = self.last_choice.get(&key) {
            if top.contains(&last) {
                return Ok(last);
            }
        }
        let choice = if top.len() == 1 {
            top[0]
        } else {
            self.round_robin_pick(inport, &top)
        };
        self.last_choice.insert(key, choice);
        Ok(choice)
    }

    /// UGAL-L: at the source router, weigh the minimal first hop against a
    /// single non-minimal one by local buffer pressure (occupied slots),
    /// charging the non-minimal path double for its extra hops. Elsewhere
    /// route minimally via the table.
    fn outport_compute_ugal(
        &mut self,
        route: &RouteInfo,
        outputs: &[OutputUnit],
    ) -> Result<usize, Error> {
        let vnet = route.vnet;
        if route.src_router != self.router_id {
            return self.lookup_routing_table(vnet, &route.net_dest);
        }

        let candidates = self.min_weight_candidates(vnet, &route.net_dest);
        if candidates.is_empty() {
            return Err(Error::NoRoute {
                router: self.router_id,
                vnet,
            });
        }
        let minimal = candidates[0];

        let nonmin_pool: Vec<usize> = (0..outputs.len())
            .filter(|&op| {
                outputs[op].direction() != PortDirection::Local && !candidates.contains(&op)
            })
            .collect();
        if nonmin_pool.is_empty() {
            self.ugal_min_choices += 1;
            return Ok(minimal);
        }
        let nonmin = nonmin_pool[self.rng.gen_range(0..nonmin_pool.len())];

        let usable_vcs = self.cfg.vcs_per_vnet - usize::from(self.cfg.escape_vc_enabled);
        let capacity = usable_vcs * self.cfg.buffer_depth;
        let pressure =
            |outport: usize| capacity.saturating_sub(outputs[outport].vnet_credits(vnet));

        if pressure(minimal) > 2 * pressure(nonmin) {
            self.ugal_nonmin_choices += 1;
            log::debug!(
                "router {} ugal: non-minimal outport {} over {}",
                self.router_id,
                nonmin,
                minimal
            );
            Ok(nonmin)
        } else {
            self.ugal_min_choices += 1;
            Ok(minimal)
        }
    }

    /// Escape routing over the spanning tree: DOWN into the child subtree
    /// containing the destination, else UP toward the parent. The tree
    /// order admits no DOWN-to-UP turn, so escape traffic cannot cycle.
    pub fn escape_route_compute(
        &mut self,
        route: &RouteInfo,
        _inport: usize,
        _inport_dirn: PortDirection,
    ) -> Result<usize, Error> {
        if route.dest_router == self.router_id {
            return self.lookup_routing_table(route.vnet, &route.net_dest);
        }

        let dest_tin = self.cfg.tin_of(route.dest_router);
        for child in &self.children {
            if dest_tin >= child.tin && dest_tin < child.tout {
                log::trace!(
                    "router {} escape DOWN via outport {}",
                    self.router_id,
                    child.outport
                );
                return Ok(child.outport);
            }
        }
        if let Some(parent) = self.parent_outport {
            log::trace!("router {} escape UP via outport {}", self.router_id, parent);
            return Ok(parent);
        }
        // Root with no covering child: table minimal is safe here.
        self.lookup_routing_table(route.vnet, &route.net_dest)
    }

    /// Feed an observed downstream credit count into the congestion EWMA.
    pub fn update_ewma(&mut self, outport: usize, vnet: usize, observed_credits: usize) {
        let ewma = &mut self.ewma[outport][vnet];
        *ewma = (1.0 - CAR3D_LAMBDA) * *ewma + CAR3D_LAMBDA * observed_credits as f64;
    }

    fn round_robin_pick(&mut self, inport: usize, top: &[usize]) -> usize {
        let pointer = self.rr_by_inport.entry(inport).or_insert(0);
        let choice = top[*pointer % top.len()];
        *pointer += 1;
        choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::link::{CreditLink, NetworkLink};
    use rand::SeedableRng;

    fn cfg() -> Rc<NetworkConfig> {
        Rc::new(NetworkConfig {
            num_rows: 2,
            num_cols: 2,
            ..Default::default()
        })
    }

    fn rng() -> Pcg64 {
        Pcg64::seed_from_u64(7)
    }

    fn output(dest: usize) -> OutputUnit {
        OutputUnit::new(
            0,
            PortDirection::East,
            4,
            4,
            4,
            false,
            NetworkLink::new(1, 128),
            CreditLink::new(1, 128),
            Some(dest),
        )
    }

    fn route_to(dest_router: usize, dest_ni: usize) -> RouteInfo {
        RouteInfo {
            vnet: 0,
            net_dest: NetDest::single(4, dest_ni),
            src_ni: 0,
            src_router: 0,
            dest_ni,
            dest_router,
            hops_traversed: 0,
        }
    }

    fn unit_with_two_outports(config: Rc<NetworkConfig>) -> RoutingUnit {
        let mut routing = RoutingUnit::new(0, config, rng());
        // Outport 0 (weight 2) and outport 1 (weight 1) both reach NI 3.
        routing.add_out_port(
            PortDirection::North,
            vec![NetDest::single(4, 3)],
            2,
        );
        routing.add_out_port(PortDirection::East, vec![NetDest::single(4, 3)], 1);
        routing.add_in_port(PortDirection::Local);
        routing
    }

    #[test]
    fn table_lookup_prefers_min_weight() {
        let mut routing = unit_with_two_outports(cfg());
        let picked = routing.lookup_routing_table(0, &NetDest::single(4, 3)).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn table_lookup_fails_without_candidates() {
        let mut routing = unit_with_two_outports(cfg());
        let err = routing
            .lookup_routing_table(0, &NetDest::single(4, 2))
            .unwrap_err();
        assert_eq!(err, Error::NoRoute { router: 0, vnet: 0 });
    }

    #[test]
    fn adaptive_prefers_more_credits() {
        let mut routing = RoutingUnit::new(0, cfg(), rng());
        routing.add_out_port(PortDirection::North, vec![NetDest::single(4, 3)], 1);
        routing.add_out_port(PortDirection::East, vec![NetDest::single(4, 3)], 1);
        routing.add_in_port(PortDirection::Local);

        let mut outputs = vec![output(1), output(2)];
        for _ in 0..3 {
            outputs[0].decrement_credit(1);
        }
        let route = route_to(3, 3);
        let picked = routing
            .outport_compute_adaptive(&route, 0, &outputs)
            .unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn car3d_sticks_to_last_choice() {
        let mut routing = RoutingUnit::new(0, cfg(), rng());
        routing.add_out_port(PortDirection::North, vec![NetDest::single(4, 3)], 1);
        routing.add_out_port(PortDirection::East, vec![NetDest::single(4, 3)], 1);
        routing.add_in_port(PortDirection::Local);
        let outputs = vec![output(1), output(2)];

        let route = route_to(3, 3);
        let first = routing.outport_compute_car3d(&route, 0, &outputs).unwrap();
        for _ in 0..5 {
            let again = routing.outport_compute_car3d(&route, 0, &outputs).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn xy_goes_east_then_north() {
        // Router 0 of a 2x2 mesh, destination router 3 (x=1, y=1).
        let mut routing = RoutingUnit::new(0, cfg(), rng());
        routing.add_out_port(PortDirection::East, vec![NetDest::single(4, 3)], 1);
        routing.add_out_port(PortDirection::North, vec![NetDest::single(4, 3)], 2);
        routing.add_in_port(PortDirection::Local);
        let route = route_to(3, 3);
        let picked = routing.outport_compute_xy(&route, 0, PortDirection::Local);
        assert_eq!(routing.out_direction(picked), PortDirection::East);

        // Same router, destination straight north (router 2).
        let route = route_to(2, 2);
        let picked = routing.outport_compute_xy(&route, 0, PortDirection::Local);
        assert_eq!(routing.out_direction(picked), PortDirection::North);
    }

    #[test]
    fn escape_tree_up_then_down() {
        // Three routers in a line, tree rooted at router 1:
        //   tin/tout: r0 = [1, 2), r1 = [0, 3), r2 = [2, 3).
        let config = Rc::new(NetworkConfig {
            num_rows: 1,
            num_cols: 3,
            euler: crate::config::EulerLabels {
                tin: vec![1, 0, 2],
                tout: vec![2, 3, 3],
            },
            ..Default::default()
        });

        // Router 0: parent is outport 0 (east toward r1).
        let mut r0 = RoutingUnit::new(0, config.clone(), rng());
        r0.add_out_port(PortDirection::East, vec![NetDest::single(3, 2)], 1);
        r0.add_in_port(PortDirection::Local);
        r0.set_parent_outport(0);
        let picked = r0
            .escape_route_compute(&route_to(2, 2), 0, PortDirection::Local)
            .unwrap();
        assert_eq!(picked, 0, "leaf routes UP toward the root");

        // Router 1 (root): child subtrees on both sides.
        let mut r1 = RoutingUnit::new(1, config, rng());
        r1.add_out_port(PortDirection::West, vec![NetDest::single(3, 0)], 1);
        r1.add_out_port(PortDirection::East, vec![NetDest::single(3, 2)], 1);
        r1.add_in_port(PortDirection::East);
        r1.add_child(0, 1, 2);
        r1.add_child(1, 2, 3);
        let picked = r1
            .escape_route_compute(&route_to(0, 0), 0, PortDirection::East)
            .unwrap();
        assert_eq!(picked, 0, "root routes DOWN into the covering subtree");
    }

    #[test]
    fn ewma_converges_toward_observations() {
        let mut routing = unit_with_two_outports(cfg());
        for _ in 0..64 {
            routing.update_ewma(0, 0, 8);
        }
        assert!((routing.ewma[0][0] - 8.0).abs() < 0.01);
    }
}
