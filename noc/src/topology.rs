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

//! Mesh construction: routers, interfaces and links wired into a
//! [`Network`], with routing tables populated from weighted shortest paths
//! and a BFS spanning tree labeled for escape routing.
//!
//! A 2D mesh with `X` links at weight 1 and `Y` links at weight 2, so the
//! min-weight candidate filter reproduces X-then-Y dimension order:
//!
//! ```text
//! 2 --- 3    ^
//! |     |    y (North)
//! 0 --- 1    v
//! <- x ->
//! ```

use petgraph::algo::dijkstra;
use petgraph::graph::{Graph, NodeIndex};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::{EulerLabels, NetworkConfig};
use crate::error::Error;
use crate::flit::NetDest;
use crate::link::{CreditLink, NetworkLink};
use crate::output_unit::OutputUnit;
use crate::router::Router;
use crate::routing::PortDirection;
use crate::sim::{ComponentId, Network, NetworkInterface};

const X_WEIGHT: i32 = 1;
const Y_WEIGHT: i32 = 2;

/// Build an `num_rows x num_cols` mesh with one interface per router.
pub fn build_mesh(cfg: NetworkConfig, seed: u64) -> Result<Network, Error> {
    build_mesh_ext(cfg, seed, &[])
}

/// As [`build_mesh`], with extra parallel copies of adjacent-router links
/// (for path-diversity experiments). Each pair `(a, b)` duplicates the
/// directed link from router `a` to its neighbor `b`.
pub fn build_mesh_ext(
    mut cfg: NetworkConfig,
    seed: u64,
    extra_links: &[(usize, usize)],
) -> Result<Network, Error> {
    cfg.validate()?;
    let rows = cfg.num_rows;
    let cols = cfg.num_cols;
    if rows == 0 || cols == 0 {
        return Err(Error::InvalidConfig(String::from(
            "mesh needs num_rows and num_cols >= 1",
        )));
    }
    let n = rows * cols;

    cfg.euler = euler_labels(rows, cols);
    let cfg = Rc::new(cfg);

    // Weighted distances for populating the minimal routing tables.
    let mut graph: Graph<(), i32> = Graph::new();
    let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();
    for id in 0..n {
        for (dirn, neighbor) in neighbors(id, rows, cols) {
            graph.add_edge(nodes[id], nodes[neighbor], direction_weight(dirn));
        }
    }
    let mut dist = vec![vec![0i32; n]; n];
    for (src, row) in dist.iter_mut().enumerate() {
        let map = dijkstra(&graph, nodes[src], None, |e| *e.weight());
        for (t, slot) in row.iter_mut().enumerate() {
            *slot = *map.get(&nodes[t]).expect("mesh is connected");
        }
    }

    let mut routers: Vec<Router> = (0..n)
        .map(|id| {
            let rng = Pcg64::seed_from_u64(seed.wrapping_add(
                (id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
            ));
            Router::new(id, cfg.clone(), rng)
        })
        .collect();

    // Local ports and interfaces first, so the Local outport is index 0.
    let mut interfaces = Vec::with_capacity(n);
    for (id, router) in routers.iter_mut().enumerate() {
        let ingress = NetworkLink::new(1, cfg.bit_width);
        let ingress_credit = CreditLink::new(1, cfg.bit_width);
        let egress = NetworkLink::new(1, cfg.bit_width);
        let egress_credit = CreditLink::new(1, cfg.bit_width);
        ingress.borrow_mut().set_consumer(ComponentId::Router(id));
        ingress_credit
            .borrow_mut()
            .set_consumer(ComponentId::Interface(id));
        egress.borrow_mut().set_consumer(ComponentId::Interface(id));
        egress_credit
            .borrow_mut()
            .set_consumer(ComponentId::Router(id));

        router.add_in_port(
            PortDirection::Local,
            ingress.clone(),
            ingress_credit.clone(),
        )?;
        let local_entry = vec![NetDest::single(n, id); cfg.num_vnets];
        router.add_out_port(
            PortDirection::Local,
            egress.clone(),
            egress_credit.clone(),
            local_entry,
            1,
            None,
        )?;

        let out = OutputUnit::new(
            0,
            PortDirection::Local,
            cfg.num_vcs(),
            cfg.vcs_per_vnet,
            cfg.buffer_depth,
            cfg.escape_vc_enabled,
            ingress,
            ingress_credit,
            Some(id),
        );
        interfaces.push(NetworkInterface::new(
            id,
            id,
            cfg.clone(),
            out,
            egress,
            egress_credit,
        ));
    }

    // Directed inter-router links, then the requested duplicates.
    let mut edge_defs: Vec<(usize, usize, PortDirection)> = Vec::new();
    for id in 0..n {
        for (dirn, neighbor) in neighbors(id, rows, cols) {
            edge_defs.push((id, neighbor, dirn));
        }
    }
    for &(a, b) in extra_links {
        let dirn = neighbors(a, rows, cols)
            .into_iter()
            .find(|&(_, neighbor)| neighbor == b)
            .map(|(dirn, _)| dirn)
            .ok_or_else(|| {
                Error::InvalidConfig(format!("extra link {}->{} is not between neighbors", a, b))
            })?;
        edge_defs.push((a, b, dirn));
    }

    for (a, b, dirn) in edge_defs {
        let weight = direction_weight(dirn);
        let data = NetworkLink::new(cfg.link_latency, cfg.bit_width);
        let credit = CreditLink::new(1, cfg.bit_width);
        data.borrow_mut().set_consumer(ComponentId::Router(b));
        credit.borrow_mut().set_consumer(ComponentId::Router(a));

        let mut reachable = NetDest::new(n);
        for t in 0..n {
            if dist[a][t] == weight + dist[b][t] {
                reachable.add(t);
            }
        }
        let entry = vec![reachable; cfg.num_vnets];
        routers[a].add_out_port(dirn, data.clone(), credit.clone(), entry, weight, Some(b))?;
        routers[b].add_in_port(opposite(dirn), data, credit)?;
    }

    // Escape spanning tree: parent outports and child Euler intervals.
    let (parent, children) = spanning_tree(rows, cols);
    for id in 0..n {
        if let Some(p) = parent[id] {
            let outport = outport_toward(&routers[id], p);
            routers[id].routing_unit_mut().set_parent_outport(outport);
        }
        for &child in &children[id] {
            let outport = outport_toward(&routers[id], child);
            let tin = cfg.tin_of(child);
            let tout = cfg.tout_of(child);
            routers[id].routing_unit_mut().add_child(outport, tin, tout);
        }
    }

    for router in routers.iter_mut() {
        router.init();
    }
    Ok(Network::new(cfg, routers, interfaces))
}

fn direction_weight(dirn: PortDirection) -> i32 {
    match dirn {
        PortDirection::East | PortDirection::West => X_WEIGHT,
        PortDirection::North | PortDirection::South => Y_WEIGHT,
        _ => 1,
    }
}

fn opposite(dirn: PortDirection) -> PortDirection {
    match dirn {
        PortDirection::East => PortDirection::West,
        PortDirection::West => PortDirection::East,
        PortDirection::North => PortDirection::South,
        PortDirection::South => PortDirection::North,
        PortDirection::Up => PortDirection::Down,
        PortDirection::Down => PortDirection::Up,
        PortDirection::Local => PortDirection::Local,
    }
}

/// Mesh neighbors of `id`, in a fixed port order.
fn neighbors(id: usize, rows: usize, cols: usize) -> Vec<(PortDirection, usize)> {
    let x = id % cols;
    let y = id / cols;
    let mut result = Vec::with_capacity(4);
    if x > 0 {
        result.push((PortDirection::West, id - 1));
    }
    if x + 1 < cols {
        result.push((PortDirection::East, id + 1));
    }
    if y > 0 {
        result.push((PortDirection::South, id - cols));
    }
    if y + 1 < rows {
        result.push((PortDirection::North, id + cols));
    }
    result
}

fn outport_toward(router: &Router, neighbor: usize) -> usize {
    (0..router.num_outports())
        .find(|&op| router.output_unit(op).dest_router() == Some(neighbor))
        .expect("no outport toward tree neighbor")
}

/// BFS tree rooted at router 0.
fn spanning_tree(rows: usize, cols: usize) -> (Vec<Option<usize>>, Vec<Vec<usize>>) {
    let n = rows * cols;
    let mut parent = vec![None; n];
    let mut children = vec![Vec::new(); n];
    let mut visited = vec![false; n];
    let mut queue = VecDeque::from(vec![0usize]);
    visited[0] = true;
    while let Some(v) = queue.pop_front() {
        for (_, neighbor) in neighbors(v, rows, cols) {
            if !visited[neighbor] {
                visited[neighbor] = true;
                parent[neighbor] = Some(v);
                children[v].push(neighbor);
                queue.push_back(neighbor);
            }
        }
    }
    (parent, children)
}

/// Euler-tour numbering of the spanning tree: a node's subtree spans the
/// half-open interval `[tin, tout)`.
fn euler_labels(rows: usize, cols: usize) -> EulerLabels {
    let n = rows * cols;
    let (_, children) = spanning_tree(rows, cols);
    let mut tin = vec![0usize; n];
    let mut tout = vec![0usize; n];
    let mut counter = 0usize;
    // Iterative DFS with an explicit exit marker.
    let mut stack = vec![(0usize, false)];
    while let Some((v, exiting)) = stack.pop() {
        if exiting {
            tout[v] = counter;
            continue;
        }
        tin[v] = counter;
        counter += 1;
        stack.push((v, true));
        for &child in children[v].iter().rev() {
            stack.push((child, false));
        }
    }
    EulerLabels { tin, tout }
}
