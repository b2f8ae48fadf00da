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

//! Congestion-aware routing over parallel links.

use noc::topology::build_mesh_ext;
use noc::{NetDest, NetworkConfig, PortDirection, RouteInfo, RoutingAlgorithm};

fn line_cfg(algorithm: RoutingAlgorithm) -> NetworkConfig {
    NetworkConfig {
        num_rows: 1,
        num_cols: 3,
        routing_algorithm: algorithm,
        ..Default::default()
    }
}

fn route_to(net: &noc::Network, src: usize, dest: usize) -> RouteInfo {
    RouteInfo {
        vnet: 0,
        net_dest: NetDest::single(net.num_routers(), dest),
        src_ni: src,
        src_router: src,
        dest_ni: dest,
        dest_router: dest,
        hops_traversed: 0,
    }
}

/// Router 1 of the line has two parallel links toward router 2; with one
/// loaded and one empty, minimal-adaptive routing must steer new flows to
/// the empty copy.
#[test]
fn adaptive_prefers_the_uncongested_parallel_link() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut net =
        build_mesh_ext(line_cfg(RoutingAlgorithm::Adaptive), 5, &[(1, 2)]).unwrap();

    // Find router 1's two East outports; drain every credit of the first.
    let east: Vec<usize> = (0..net.router(1).num_outports())
        .filter(|&op| net.router(1).outport_direction(op) == PortDirection::East)
        .collect();
    assert_eq!(east.len(), 2);
    let (loaded, empty) = (east[0], east[1]);
    let depth = net.cfg().buffer_depth;
    let num_vcs = net.cfg().num_vcs();
    for vc in 0..num_vcs {
        for _ in 0..depth {
            net.router_mut(1).output_unit_mut(loaded).decrement_credit(vc);
        }
    }

    let route = route_to(&net, 0, 2);
    let inport = 1; // router 1's inport from router 0
    let mut to_empty = 0;
    const FLOWS: usize = 100;
    for _ in 0..FLOWS {
        let picked = net
            .router_mut(1)
            .route_compute(&route, inport, PortDirection::West)
            .unwrap();
        if picked == empty {
            to_empty += 1;
        }
    }
    assert!(
        to_empty * 10 >= FLOWS * 9,
        "only {}/{} flows took the empty link",
        to_empty,
        FLOWS
    );
}

/// Same fabric end to end: traffic pumped through the parallel pair must
/// deliver everything with the loaded link avoided at decision time.
#[test]
fn adaptive_traffic_drains_over_parallel_links() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut net =
        build_mesh_ext(line_cfg(RoutingAlgorithm::Adaptive), 9, &[(1, 2)]).unwrap();
    const PACKETS: usize = 20;
    for _ in 0..PACKETS {
        net.inject(0, 2, 0, 2);
    }
    net.run_until(1_000).unwrap();
    assert_eq!(net.total_received(), PACKETS);
}

/// UGAL-L at the source: heavy pressure on the minimal first hop flips the
/// decision to a non-minimal one, and the choice counters record it.
#[test]
fn ugal_derouting_under_minimal_pressure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = NetworkConfig {
        num_rows: 2,
        num_cols: 2,
        routing_algorithm: RoutingAlgorithm::Ugal,
        ..Default::default()
    };
    let mut net = noc::topology::build_mesh(cfg, 13).unwrap();

    // Unloaded: router 0 routes to its East neighbor minimally.
    let route = route_to(&net, 0, 1);
    let picked = net
        .router_mut(0)
        .route_compute(&route, 0, PortDirection::Local)
        .unwrap();
    assert_eq!(net.router(0).outport_direction(picked), PortDirection::East);
    let (min_before, nonmin_before) = net.router(0).routing_unit().ugal_choices();
    assert!(min_before >= 1);
    assert_eq!(nonmin_before, 0);

    // Drain the East outport completely; the only non-minimal candidate
    // (North) is empty, so UGAL must deroute.
    let east = (0..net.router(0).num_outports())
        .find(|&op| net.router(0).outport_direction(op) == PortDirection::East)
        .unwrap();
    let depth = net.cfg().buffer_depth;
    let num_vcs = net.cfg().num_vcs();
    for vc in 0..num_vcs {
        for _ in 0..depth {
            net.router_mut(0).output_unit_mut(east).decrement_credit(vc);
        }
    }
    let picked = net
        .router_mut(0)
        .route_compute(&route, 0, PortDirection::Local)
        .unwrap();
    assert_eq!(net.router(0).outport_direction(picked), PortDirection::North);
    let (_, nonmin_after) = net.router(0).routing_unit().ugal_choices();
    assert_eq!(nonmin_after, 1);
}
