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

//! Flits and credits, the two units moved across links.
//!
//! A [`Flit`] is either a pipeline unit of a packet (`Data`) or a SPIN
//! control message (`Control`); the two kinds share only the scheduling
//! fields. A [`Credit`] flows upstream to report a freed buffer slot.

use bitvec::prelude::*;
use std::collections::VecDeque;
use std::fmt;

use crate::{Cycles, Tick};

pub type PacketId = u64;

/// Router pipeline stages a flit advances through within one hop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FlitStage {
    /// Ingress (just buffered).
    I,
    /// Virtual-channel allocation (folded into SA here, kept for traces).
    Va,
    /// Switch allocation.
    Sa,
    /// Switch traversal.
    St,
    /// Link traversal.
    Lt,
}

/// Position of a data flit within its packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DataKind {
    Head,
    Body,
    Tail,
    /// Single-flit packet.
    HeadTail,
}

impl DataKind {
    pub fn is_head(self) -> bool {
        matches!(self, DataKind::Head | DataKind::HeadTail)
    }

    pub fn is_tail(self) -> bool {
        matches!(self, DataKind::Tail | DataKind::HeadTail)
    }
}

/// SPIN control message kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControlKind {
    Probe,
    Move,
    CheckProbe,
    KillMove,
}

/// A set of destination network interfaces, for table-based routing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetDest {
    bits: BitVec,
}

impl NetDest {
    pub fn new(num_nis: usize) -> Self {
        Self {
            bits: bitvec![0; num_nis],
        }
    }

    pub fn single(num_nis: usize, ni: usize) -> Self {
        let mut dest = Self::new(num_nis);
        dest.add(ni);
        dest
    }

    pub fn add(&mut self, ni: usize) {
        self.bits.set(ni, true);
    }

    pub fn contains(&self, ni: usize) -> bool {
        self.bits.get(ni).map(|b| *b).unwrap_or(false)
    }

    pub fn intersects(&self, other: &NetDest) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| *a && *b)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }
}

/// Routing metadata carried by every data flit of a packet.
#[derive(Clone, Debug)]
pub struct RouteInfo {
    pub vnet: usize,
    pub net_dest: NetDest,
    pub src_ni: usize,
    pub src_router: usize,
    pub dest_ni: usize,
    pub dest_router: usize,
    pub hops_traversed: u32,
}

/// Packet-pipelining payload of a data flit.
#[derive(Clone, Debug)]
pub struct DataFlit {
    pub packet_id: PacketId,
    /// Flit index within the packet, 0-based.
    pub index: usize,
    pub kind: DataKind,
    pub route: RouteInfo,
    /// Packet length in flits.
    pub size: usize,
    pub enqueue_time: Tick,
    pub dequeue_time: Tick,
    pub src_delay: Cycles,
    /// Set while the flit is rotated along a dependency cycle.
    pub part_of_move: bool,
}

/// Payload of a SPIN control flit.
#[derive(Clone, Debug)]
pub struct ControlFlit {
    pub kind: ControlKind,
    /// Message id, unique per source router.
    pub msg_id: u64,
    pub source_router: usize,
    pub source_inport: usize,
    pub source_vc: usize,
    /// Outport sequence describing the dependency cycle, FIFO order.
    pub path: VecDeque<usize>,
    /// Accumulated traversal delay, for loop-latency accounting.
    pub delay: Cycles,
    /// KILL_MOVE flits on a matching path must be forwarded.
    pub must_send: bool,
}

impl ControlFlit {
    pub fn peek_top(&self) -> Option<usize> {
        self.path.front().copied()
    }

    pub fn pop_top(&mut self) -> usize {
        self.path.pop_front().expect("control flit path is empty")
    }

    pub fn push(&mut self, outport: usize) {
        self.path.push_back(outport);
    }

    pub fn num_turns(&self) -> usize {
        self.path.len()
    }
}

#[derive(Clone, Debug)]
pub enum FlitBody {
    Data(DataFlit),
    Control(ControlFlit),
}

/// One link-level transfer unit.
#[derive(Clone, Debug)]
pub struct Flit {
    vnet: usize,
    vc: usize,
    outport: Option<usize>,
    time: Tick,
    stage: (FlitStage, Tick),
    width: u32,
    body: FlitBody,
}

impl Flit {
    pub fn new_data(
        packet_id: PacketId,
        index: usize,
        kind: DataKind,
        vc: usize,
        route: RouteInfo,
        size: usize,
        width: u32,
        now: Tick,
    ) -> Self {
        let vnet = route.vnet;
        Self {
            vnet,
            vc,
            outport: None,
            time: now,
            stage: (FlitStage::I, now),
            width,
            body: FlitBody::Data(DataFlit {
                packet_id,
                index,
                kind,
                route,
                size,
                enqueue_time: now,
                dequeue_time: now,
                src_delay: 0,
                part_of_move: false,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_control(
        kind: ControlKind,
        msg_id: u64,
        source_router: usize,
        source_inport: usize,
        source_vc: usize,
        vnet: usize,
        outport: usize,
        path: VecDeque<usize>,
        width: u32,
        now: Tick,
    ) -> Self {
        Self {
            vnet,
            vc: source_vc,
            outport: Some(outport),
            time: now,
            stage: (FlitStage::I, now),
            width,
            body: FlitBody::Control(ControlFlit {
                kind,
                msg_id,
                source_router,
                source_inport,
                source_vc,
                path,
                delay: 0,
                must_send: false,
            }),
        }
    }

    pub fn vnet(&self) -> usize {
        self.vnet
    }

    pub fn vc(&self) -> usize {
        self.vc
    }

    pub fn set_vc(&mut self, vc: usize) {
        self.vc = vc;
    }

    pub fn outport(&self) -> Option<usize> {
        self.outport
    }

    pub fn set_outport(&mut self, outport: usize) {
        self.outport = Some(outport);
    }

    pub fn time(&self) -> Tick {
        self.time
    }

    pub fn set_time(&mut self, time: Tick) {
        self.time = time;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn stage(&self) -> (FlitStage, Tick) {
        self.stage
    }

    pub fn advance_stage(&mut self, stage: FlitStage, time: Tick) {
        self.stage = (stage, time);
    }

    /// True iff the flit sits in `stage` and its entry time has passed.
    pub fn is_stage(&self, stage: FlitStage, time: Tick) -> bool {
        self.stage.0 == stage && time >= self.stage.1
    }

    pub fn is_data(&self) -> bool {
        matches!(self.body, FlitBody::Data(_))
    }

    pub fn is_control(&self) -> bool {
        matches!(self.body, FlitBody::Control(_))
    }

    pub fn data(&self) -> &DataFlit {
        match &self.body {
            FlitBody::Data(d) => d,
            FlitBody::Control(_) => panic!("control flit treated as data"),
        }
    }

    pub fn data_mut(&mut self) -> &mut DataFlit {
        match &mut self.body {
            FlitBody::Data(d) => d,
            FlitBody::Control(_) => panic!("control flit treated as data"),
        }
    }

    pub fn control(&self) -> &ControlFlit {
        match &self.body {
            FlitBody::Control(c) => c,
            FlitBody::Data(_) => panic!("data flit treated as control"),
        }
    }

    pub fn control_mut(&mut self) -> &mut ControlFlit {
        match &mut self.body {
            FlitBody::Control(c) => c,
            FlitBody::Data(_) => panic!("data flit treated as control"),
        }
    }

    pub fn route(&self) -> &RouteInfo {
        &self.data().route
    }

    pub fn is_head_kind(&self) -> bool {
        matches!(&self.body, FlitBody::Data(d) if d.kind.is_head())
    }

    pub fn is_tail_kind(&self) -> bool {
        matches!(&self.body, FlitBody::Data(d) if d.kind.is_tail())
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.body {
            FlitBody::Data(d) => write!(
                f,
                "flit {}.{} {:?} vnet {} vc {} t={}",
                d.packet_id, d.index, d.kind, self.vnet, self.vc, self.time
            ),
            FlitBody::Control(c) => write!(
                f,
                "{:?} from router {} vc {} turns {} t={}",
                c.kind,
                c.source_router,
                c.source_vc,
                c.num_turns(),
                self.time
            ),
        }
    }
}

/// An upstream-flowing message reporting a freed buffer slot.
#[derive(Clone, Debug)]
pub struct Credit {
    pub vc: usize,
    /// Set when the sending VC returned to idle (TAIL/HEAD_TAIL forwarded).
    pub is_free: bool,
    pub time: Tick,
}

impl Credit {
    pub fn new(vc: usize, is_free: bool, time: Tick) -> Self {
        Self { vc, is_free, time }
    }
}

/// Time-ordered FIFO of flits, used for the router-owned control queues.
#[derive(Debug, Default)]
pub(crate) struct FlitBuffer {
    queue: VecDeque<Flit>,
}

impl FlitBuffer {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn is_ready(&self, now: Tick) -> bool {
        self.queue.front().map(|f| f.time() <= now).unwrap_or(false)
    }

    pub fn insert(&mut self, flit: Flit) {
        debug_assert!(self
            .queue
            .back()
            .map(|b| b.time() <= flit.time())
            .unwrap_or(true));
        self.queue.push_back(flit);
    }

    pub fn pop(&mut self) -> Option<Flit> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: usize) -> RouteInfo {
        RouteInfo {
            vnet: 0,
            net_dest: NetDest::single(4, dest),
            src_ni: 0,
            src_router: 0,
            dest_ni: dest,
            dest_router: dest,
            hops_traversed: 0,
        }
    }

    #[test]
    fn stage_gating() {
        let mut f = Flit::new_data(1, 0, DataKind::HeadTail, 0, route(3), 1, 128, 10);
        assert!(f.is_stage(FlitStage::I, 10));
        f.advance_stage(FlitStage::Sa, 12);
        assert!(!f.is_stage(FlitStage::Sa, 11));
        assert!(f.is_stage(FlitStage::Sa, 12));
        assert!(f.is_stage(FlitStage::Sa, 20));
        assert!(!f.is_stage(FlitStage::St, 20));
    }

    #[test]
    fn path_helpers() {
        let mut f = Flit::new_control(
            ControlKind::Probe,
            7,
            2,
            1,
            0,
            0,
            3,
            VecDeque::from(vec![3]),
            128,
            0,
        );
        assert_eq!(f.control().peek_top(), Some(3));
        f.control_mut().push(1);
        f.control_mut().push(2);
        assert_eq!(f.control().num_turns(), 3);
        assert_eq!(f.control_mut().pop_top(), 3);
        assert_eq!(f.control().peek_top(), Some(1));
    }

    #[test]
    fn netdest_intersection() {
        let mut a = NetDest::new(8);
        a.add(2);
        a.add(5);
        let b = NetDest::single(8, 5);
        let c = NetDest::single(8, 1);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(!NetDest::new(8).intersects(&a));
    }

    #[test]
    fn head_tail_classification() {
        let ht = Flit::new_data(1, 0, DataKind::HeadTail, 0, route(1), 1, 128, 0);
        assert!(ht.is_head_kind() && ht.is_tail_kind());
        let body = Flit::new_data(1, 1, DataKind::Body, 0, route(1), 3, 128, 0);
        assert!(!body.is_head_kind() && !body.is_tail_kind());
    }
}
