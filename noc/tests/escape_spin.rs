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

//! Escape-VC priority and SPIN deadlock recovery, on hand-wired fabrics.

use std::rc::Rc;

use rand::SeedableRng;
use rand_pcg::Pcg64;

use noc::{
    ComponentId, CreditLink, DataKind, EulerLabels, Flit, NetDest, Network, NetworkConfig,
    NetworkInterface, NetworkLink, OutputUnit, PortDirection, RouteInfo, Router, Scheduler,
};

fn route(num_nis: usize, src: usize, dest: usize) -> RouteInfo {
    RouteInfo {
        vnet: 0,
        net_dest: NetDest::single(num_nis, dest),
        src_ni: src,
        src_router: src,
        dest_ni: dest,
        dest_router: dest,
        hops_traversed: 0,
    }
}

/// SA must grant an escape VC over a non-escape VC contending for the same
/// outport, even when round-robin order favors the other inport.
#[test]
fn escape_vc_wins_the_contended_outport() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = Rc::new(NetworkConfig {
        num_vnets: 1,
        vcs_per_vnet: 2,
        buffer_depth: 2,
        escape_vc_enabled: true,
        ordered_vnets: vec![false],
        num_rows: 1,
        num_cols: 2,
        euler: EulerLabels {
            tin: vec![0, 1],
            tout: vec![2, 2],
        },
        ..Default::default()
    });
    let width = cfg.bit_width;
    let mut scheduler = Scheduler::new();
    let mut r0 = Router::new(0, cfg.clone(), Pcg64::seed_from_u64(1));
    let mut r1 = Router::new(1, cfg.clone(), Pcg64::seed_from_u64(2));

    // Two injection inports into router 0. The regular flit sits on the
    // lower inport index, so plain round-robin would serve it first.
    let in_regular = NetworkLink::new(1, width);
    in_regular.borrow_mut().set_consumer(ComponentId::Router(0));
    let in_regular_credit = CreditLink::new(1, width);
    r0.add_in_port(PortDirection::West, in_regular.clone(), in_regular_credit)
        .unwrap();
    let in_escape = NetworkLink::new(1, width);
    in_escape.borrow_mut().set_consumer(ComponentId::Router(0));
    let in_escape_credit = CreditLink::new(1, width);
    r0.add_in_port(PortDirection::South, in_escape.clone(), in_escape_credit)
        .unwrap();

    // Router 0 -> router 1 (the escape tree's only edge).
    let forward = NetworkLink::new(1, width);
    forward.borrow_mut().set_consumer(ComponentId::Router(1));
    let forward_credit = CreditLink::new(1, width);
    forward_credit.borrow_mut().set_consumer(ComponentId::Router(0));
    let east = r0
        .add_out_port(
            PortDirection::East,
            forward.clone(),
            forward_credit.clone(),
            vec![NetDest::single(2, 1)],
            1,
            Some(1),
        )
        .unwrap();
    r0.routing_unit_mut().add_child(east, 1, 2);

    // Router 1 ejects everything to a sink link.
    r1.add_in_port(PortDirection::West, forward, forward_credit)
        .unwrap();
    let sink = NetworkLink::new(1, width);
    sink.borrow_mut().set_consumer(ComponentId::Interface(0));
    let sink_credit = CreditLink::new(1, width);
    sink_credit.borrow_mut().set_consumer(ComponentId::Router(1));
    r1.add_out_port(
        PortDirection::Local,
        sink.clone(),
        sink_credit,
        vec![NetDest::single(2, 1)],
        1,
        None,
    )
    .unwrap();
    r0.init();
    r1.init();

    // Same tick, same target outport: packet 7 on a regular VC, packet 9
    // on the escape VC.
    in_regular.borrow_mut().send(
        Flit::new_data(7, 0, DataKind::HeadTail, 1, route(2, 0, 1), 1, width, 0),
        0,
        &mut scheduler,
    );
    in_escape.borrow_mut().send(
        Flit::new_data(9, 0, DataKind::HeadTail, 0, route(2, 0, 1), 1, width, 0),
        0,
        &mut scheduler,
    );

    while let Some((tick, component)) = scheduler.pop_next() {
        if tick > 60 {
            break;
        }
        match component {
            ComponentId::Router(0) => r0.wakeup(&mut scheduler).unwrap(),
            ComponentId::Router(1) => r1.wakeup(&mut scheduler).unwrap(),
            _ => {}
        }
    }

    let mut order = Vec::new();
    {
        let mut link = sink.borrow_mut();
        while link.is_ready(1_000) {
            order.push(link.consume().data().packet_id);
        }
    }
    assert_eq!(order, vec![9, 7], "escape flit must exit first");
}

// ---------------------------------------------------------------------------
// SPIN recovery on a four-router unidirectional ring.
// ---------------------------------------------------------------------------

const RING: [(usize, usize, PortDirection); 4] = [
    (0, 1, PortDirection::East),
    (1, 3, PortDirection::North),
    (3, 2, PortDirection::West),
    (2, 0, PortDirection::South),
];

fn opposite(dirn: PortDirection) -> PortDirection {
    match dirn {
        PortDirection::East => PortDirection::West,
        PortDirection::West => PortDirection::East,
        PortDirection::North => PortDirection::South,
        PortDirection::South => PortDirection::North,
        other => other,
    }
}

/// Four routers in a cycle, one VC per link. Injecting a packet at every
/// router toward the router two hops around creates the classic cyclic VC
/// dependence: every packet holds the VC the previous one needs.
fn ring_network(spin: bool) -> Network {
    let cfg = Rc::new(NetworkConfig {
        num_vnets: 1,
        vcs_per_vnet: 1,
        buffer_depth: 2,
        spin_scheme_enabled: spin,
        dd_threshold: 16,
        spin_max_turn_capacity: 8,
        ordered_vnets: vec![false],
        num_rows: 2,
        num_cols: 2,
        ..Default::default()
    });
    let width = cfg.bit_width;

    let mut routers: Vec<Router> = (0..4)
        .map(|id| Router::new(id, cfg.clone(), Pcg64::seed_from_u64(100 + id as u64)))
        .collect();
    let mut interfaces = Vec::new();
    for (id, router) in routers.iter_mut().enumerate() {
        let ingress = NetworkLink::new(1, width);
        let ingress_credit = CreditLink::new(1, width);
        let egress = NetworkLink::new(1, width);
        let egress_credit = CreditLink::new(1, width);
        ingress.borrow_mut().set_consumer(ComponentId::Router(id));
        ingress_credit
            .borrow_mut()
            .set_consumer(ComponentId::Interface(id));
        egress.borrow_mut().set_consumer(ComponentId::Interface(id));
        egress_credit
            .borrow_mut()
            .set_consumer(ComponentId::Router(id));
        router
            .add_in_port(PortDirection::Local, ingress.clone(), ingress_credit.clone())
            .unwrap();
        router
            .add_out_port(
                PortDirection::Local,
                egress.clone(),
                egress_credit.clone(),
                vec![NetDest::single(4, id)],
                1,
                None,
            )
            .unwrap();
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

    for (a, b, dirn) in RING {
        let data = NetworkLink::new(1, width);
        let credit = CreditLink::new(1, width);
        data.borrow_mut().set_consumer(ComponentId::Router(b));
        credit.borrow_mut().set_consumer(ComponentId::Router(a));
        let mut reachable = NetDest::new(4);
        for t in 0..4 {
            if t != a {
                reachable.add(t);
            }
        }
        routers[a]
            .add_out_port(dirn, data.clone(), credit.clone(), vec![reachable], 1, Some(b))
            .unwrap();
        routers[b].add_in_port(opposite(dirn), data, credit).unwrap();
    }
    for router in routers.iter_mut() {
        router.init();
    }
    Network::new(cfg, routers, interfaces)
}

fn inject_cycle(net: &mut Network) -> [u64; 4] {
    // Each flow's destination is two hops around the ring, so every packet
    // parks at an intermediate router holding the next flow's VC.
    let a = net.inject(0, 3, 0, 2);
    let b = net.inject(1, 2, 0, 2);
    let c = net.inject(3, 0, 0, 2);
    let d = net.inject(2, 1, 0, 2);
    [a, b, c, d]
}

/// Without recovery the ring wedges permanently.
#[test]
fn ring_deadlocks_without_spin() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut net = ring_network(false);
    inject_cycle(&mut net);
    net.run_until(500).unwrap();
    assert_eq!(net.total_received(), 0, "the cycle should never drain");
}

/// With SPIN enabled the cycle is detected, one rotation breaks it, and
/// everything drains.
#[test]
fn spin_breaks_the_cycle_and_drains() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut net = ring_network(true);
    let [a, b, c, d] = inject_cycle(&mut net);
    net.run_until(300).unwrap();

    assert_eq!(net.total_received(), 4);
    let delivered = |ni: usize| {
        let records = net.interface(ni).received();
        assert_eq!(records.len(), 1, "ni {} received {:?}", ni, records);
        records[0].clone()
    };
    assert_eq!(delivered(3).packet_id, a);
    assert_eq!(delivered(2).packet_id, b);
    assert_eq!(delivered(0).packet_id, c);
    assert_eq!(delivered(1).packet_id, d);

    for ni in [0, 1, 2, 3] {
        let record = delivered(ni);
        assert!(
            record.eject_tick > u64::from(net.cfg().dd_threshold),
            "delivery before the detection threshold means no deadlock formed"
        );
        // Detection plus a handful of loop delays; generous slack on top.
        assert!(
            record.eject_tick < 200,
            "recovery took too long: {:?}",
            record
        );
    }

    // Recovery state is fully retired afterwards.
    for r in 0..4 {
        let router = net.router(r);
        assert_eq!(router.move_registry_len(), 0, "router {} registry", r);
        assert!(!router.move_bit(), "router {} move bit", r);
        assert!(!router.path_buffer_valid(), "router {} path buffer", r);
        assert!(
            !router.source_id_buffer_valid(),
            "router {} source id buffer",
            r
        );
    }
}
