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

//! The host side of the model: a discrete-event scheduler ticking routers
//! and network interfaces, and a [`Network`] owning all of them. The router
//! core only ever sees the scheduler's narrow interface
//! (`now`/`schedule`/`already_scheduled`), so a different host can replace
//! this module wholesale.

use std::collections::{BTreeSet, VecDeque};

use crate::config::NetworkConfig;
use crate::error::Error;
use crate::flit::{Credit, DataKind, Flit, PacketId, RouteInfo};
use crate::link::{CreditLinkHandle, NetworkLinkHandle};
use crate::output_unit::OutputUnit;
use crate::router::Router;
use crate::Tick;
use std::rc::Rc;

/// Everything the scheduler can wake. Routers sort before interfaces, so
/// same-tick deliveries are ejected the tick they arrive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ComponentId {
    Router(usize),
    Interface(usize),
}

/// Minimal discrete-event scheduler: a set of pending `(tick, component)`
/// wakeups. One cycle is one tick.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: Tick,
    queue: BTreeSet<(Tick, ComponentId)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn schedule(&mut self, component: ComponentId, at: Tick) {
        debug_assert!(at >= self.now, "scheduling into the past");
        self.queue.insert((at, component));
    }

    pub fn already_scheduled(&self, component: ComponentId, at: Tick) -> bool {
        self.queue.contains(&(at, component))
    }

    /// Next pending wakeup, advancing the clock to it.
    pub fn pop_next(&mut self) -> Option<(Tick, ComponentId)> {
        let entry = *self.queue.iter().next()?;
        self.queue.remove(&entry);
        self.now = entry.0;
        Some(entry)
    }

    pub fn peek_next(&self) -> Option<(Tick, ComponentId)> {
        self.queue.iter().next().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Move the clock forward with nothing to do (end of a run window).
    pub fn advance_to(&mut self, tick: Tick) {
        if tick > self.now {
            self.now = tick;
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPacket {
    id: PacketId,
    route: RouteInfo,
    size: usize,
}

#[derive(Debug)]
struct InFlight {
    packet: PendingPacket,
    vc: usize,
    next_index: usize,
}

/// A delivered packet, as seen by the destination interface.
#[derive(Debug, Clone)]
pub struct EjectRecord {
    pub packet_id: PacketId,
    pub src_ni: usize,
    pub enqueue_tick: Tick,
    pub eject_tick: Tick,
    pub hops: u32,
}

/// Endpoint injecting and ejecting packets at one router.
///
/// Injection mirrors the router inport's VC state through an
/// [`OutputUnit`] (free-VC selection, credits); ejection consumes the
/// router's Local output link and returns a credit per flit, an infinite
/// sink unless deliberately stalled by a test.
#[derive(Debug)]
pub struct NetworkInterface {
    id: usize,
    router_id: usize,
    cfg: Rc<NetworkConfig>,
    out: OutputUnit,
    in_link: NetworkLinkHandle,
    in_credit_link: CreditLinkHandle,
    pending: VecDeque<PendingPacket>,
    in_flight: Option<InFlight>,
    stalled: bool,
    sent: Vec<(PacketId, Tick)>,
    received: Vec<EjectRecord>,
}

impl NetworkInterface {
    pub fn new(
        id: usize,
        router_id: usize,
        cfg: Rc<NetworkConfig>,
        out: OutputUnit,
        in_link: NetworkLinkHandle,
        in_credit_link: CreditLinkHandle,
    ) -> Self {
        Self {
            id,
            router_id,
            cfg,
            out,
            in_link,
            in_credit_link,
            pending: VecDeque::new(),
            in_flight: None,
            stalled: false,
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn router_id(&self) -> usize {
        self.router_id
    }

    /// Stop (or resume) draining ejected flits. Stalled sinks hold their
    /// credits, so upstream buffers fill up behind them.
    pub fn set_sink_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn sent(&self) -> &[(PacketId, Tick)] {
        &self.sent
    }

    pub fn received(&self) -> &[EjectRecord] {
        &self.received
    }

    pub(crate) fn queue_packet(&mut self, id: PacketId, route: RouteInfo, size: usize) {
        assert!(size >= 1);
        self.pending.push_back(PendingPacket { id, route, size });
    }

    pub fn wakeup(&mut self, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        self.out.wakeup(now);
        self.eject(now, scheduler);
        self.inject(now, scheduler);

        let more_to_send = self.in_flight.is_some() || !self.pending.is_empty();
        let holding_input = self.stalled && self.in_link.borrow().is_ready(now);
        if more_to_send || holding_input {
            let me = ComponentId::Interface(self.id);
            if !scheduler.already_scheduled(me, now + 1) {
                scheduler.schedule(me, now + 1);
            }
        }
    }

    fn eject(&mut self, now: Tick, scheduler: &mut Scheduler) {
        if self.stalled {
            return;
        }
        loop {
            let flit = {
                let mut link = self.in_link.borrow_mut();
                if !link.is_ready(now) {
                    break;
                }
                link.consume()
            };
            let is_tail = flit.is_tail_kind();
            self.in_credit_link
                .borrow_mut()
                .send(Credit::new(flit.vc(), is_tail, now), now, scheduler);
            if is_tail {
                let data = flit.data();
                log::debug!(
                    "ni {}: packet {} from ni {} delivered at {}",
                    self.id,
                    data.packet_id,
                    data.route.src_ni,
                    now
                );
                self.received.push(EjectRecord {
                    packet_id: data.packet_id,
                    src_ni: data.route.src_ni,
                    enqueue_tick: data.enqueue_time,
                    eject_tick: now,
                    hops: data.route.hops_traversed,
                });
            }
        }
    }

    /// Send at most one flit per cycle, credit permitting.
    fn inject(&mut self, now: Tick, scheduler: &mut Scheduler) {
        if self.in_flight.is_none() {
            if let Some(packet) = self.pending.pop_front() {
                match self.out.select_free_vc(packet.route.vnet, now) {
                    Some(vc) => {
                        self.in_flight = Some(InFlight {
                            packet,
                            vc,
                            next_index: 0,
                        });
                    }
                    None => self.pending.push_front(packet),
                }
            }
        }

        let Some(flight) = &mut self.in_flight else {
            return;
        };
        if !self.out.has_credit(flight.vc) {
            return;
        }

        let packet = &flight.packet;
        let kind = if packet.size == 1 {
            DataKind::HeadTail
        } else if flight.next_index == 0 {
            DataKind::Head
        } else if flight.next_index == packet.size - 1 {
            DataKind::Tail
        } else {
            DataKind::Body
        };
        let flit = Flit::new_data(
            packet.id,
            flight.next_index,
            kind,
            flight.vc,
            packet.route.clone(),
            packet.size,
            self.cfg.bit_width,
            now,
        );
        if flight.next_index == 0 {
            self.sent.push((packet.id, now));
        }
        self.out.decrement_credit(flight.vc);
        self.out.send_on_link(flit, now, scheduler);
        flight.next_index += 1;
        if flight.next_index == packet.size {
            self.in_flight = None;
        }
    }
}

/// A wired-up network: routers, interfaces, and the scheduler driving them.
pub struct Network {
    cfg: Rc<NetworkConfig>,
    routers: Vec<Router>,
    interfaces: Vec<NetworkInterface>,
    scheduler: Scheduler,
    next_packet_id: PacketId,
}

impl Network {
    pub fn new(
        cfg: Rc<NetworkConfig>,
        routers: Vec<Router>,
        interfaces: Vec<NetworkInterface>,
    ) -> Self {
        Self {
            cfg,
            routers,
            interfaces,
            scheduler: Scheduler::new(),
            next_packet_id: 0,
        }
    }

    pub fn cfg(&self) -> &NetworkConfig {
        &self.cfg
    }

    pub fn num_routers(&self) -> usize {
        self.routers.len()
    }

    pub fn router(&self, id: usize) -> &Router {
        &self.routers[id]
    }

    pub fn router_mut(&mut self, id: usize) -> &mut Router {
        &mut self.routers[id]
    }

    pub fn interface(&self, id: usize) -> &NetworkInterface {
        &self.interfaces[id]
    }

    pub fn interface_mut(&mut self, id: usize) -> &mut NetworkInterface {
        &mut self.interfaces[id]
    }

    pub fn now(&self) -> Tick {
        self.scheduler.now()
    }

    /// Queue a `size`-flit packet from one interface to another. Returns
    /// the packet id; delivery shows up in the destination's records.
    pub fn inject(
        &mut self,
        src_ni: usize,
        dest_ni: usize,
        vnet: usize,
        size: usize,
    ) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        let route = RouteInfo {
            vnet,
            net_dest: crate::flit::NetDest::single(self.interfaces.len(), dest_ni),
            src_ni,
            src_router: self.interfaces[src_ni].router_id(),
            dest_ni,
            dest_router: self.interfaces[dest_ni].router_id(),
            hops_traversed: 0,
        };
        self.interfaces[src_ni].queue_packet(id, route, size);
        let me = ComponentId::Interface(src_ni);
        let at = self.scheduler.now() + 1;
        if !self.scheduler.already_scheduled(me, at) {
            self.scheduler.schedule(me, at);
        }
        id
    }

    /// Process events up to and including `limit`.
    pub fn run_until(&mut self, limit: Tick) -> Result<(), Error> {
        while let Some((tick, _)) = self.scheduler.peek_next() {
            if tick > limit {
                break;
            }
            let (_, component) = self.scheduler.pop_next().expect("peeked entry vanished");
            match component {
                ComponentId::Router(id) => self.routers[id].wakeup(&mut self.scheduler)?,
                ComponentId::Interface(id) => {
                    self.interfaces[id].wakeup(&mut self.scheduler);
                }
            }
        }
        self.scheduler.advance_to(limit);
        Ok(())
    }

    /// Total packets delivered network-wide.
    pub fn total_received(&self) -> usize {
        self.interfaces.iter().map(|ni| ni.received().len()).sum()
    }
}
