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

use std::collections::VecDeque;

use crate::flit::{Flit, FlitStage};
use crate::{Tick, TICK_INFINITY};

/// Lifecycle of an input virtual channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VcState {
    Idle,
    Active,
}

/// Per-input-port virtual channel: a flit FIFO plus the routing decisions
/// made for the packet currently occupying it.
#[derive(Debug)]
pub struct VirtualChannel {
    state: VcState,
    state_time: Tick,
    buffer: VecDeque<Flit>,
    outport: Option<usize>,
    outvc: Option<usize>,
    enqueue_time: Tick,
    /// Set while the VC participates in a deadlock-recovery move.
    frozen: bool,
}

impl Default for VirtualChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualChannel {
    pub fn new() -> Self {
        Self {
            state: VcState::Idle,
            state_time: 0,
            buffer: VecDeque::new(),
            outport: None,
            outvc: None,
            enqueue_time: TICK_INFINITY,
            frozen: false,
        }
    }

    pub fn state(&self) -> VcState {
        self.state
    }

    pub fn set_idle(&mut self, time: Tick) {
        self.state = VcState::Idle;
        self.state_time = time;
        self.outport = None;
        self.outvc = None;
        self.enqueue_time = TICK_INFINITY;
    }

    pub fn set_active(&mut self, time: Tick) {
        self.state = VcState::Active;
        self.state_time = time;
        self.enqueue_time = time;
    }

    pub fn insert_flit(&mut self, flit: Flit) {
        self.buffer.push_back(flit);
    }

    pub fn peek_top_flit(&self) -> Option<&Flit> {
        self.buffer.front()
    }

    pub fn peek_top_flit_mut(&mut self) -> Option<&mut Flit> {
        self.buffer.front_mut()
    }

    pub fn pop_top_flit(&mut self) -> Option<Flit> {
        self.buffer.pop_front()
    }

    /// True iff the head flit has reached switch allocation by `time`.
    pub fn is_ready(&self, time: Tick) -> bool {
        self.buffer
            .front()
            .map(|f| f.is_stage(FlitStage::Sa, time))
            .unwrap_or(false)
    }

    pub fn grant_outport(&mut self, outport: usize) {
        self.outport = Some(outport);
    }

    pub fn grant_outvc(&mut self, outvc: usize) {
        self.outvc = Some(outvc);
    }

    pub fn clear_outvc(&mut self) {
        self.outvc = None;
    }

    pub fn outport(&self) -> Option<usize> {
        self.outport
    }

    pub fn outvc(&self) -> Option<usize> {
        self.outvc
    }

    pub fn enqueue_time(&self) -> Tick {
        self.enqueue_time
    }

    pub fn set_enqueue_time(&mut self, time: Tick) {
        self.enqueue_time = time;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Move precondition: the buffered packet is complete.
    pub fn contains_head_and_tail(&self) -> bool {
        self.buffer.iter().any(|f| f.is_head_kind()) && self.buffer.iter().any(|f| f.is_tail_kind())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::{DataKind, NetDest, RouteInfo};

    fn data_flit(kind: DataKind, index: usize, stage_time: Tick) -> Flit {
        let route = RouteInfo {
            vnet: 0,
            net_dest: NetDest::single(2, 1),
            src_ni: 0,
            src_router: 0,
            dest_ni: 1,
            dest_router: 1,
            hops_traversed: 0,
        };
        let mut f = Flit::new_data(9, index, kind, 0, route, 3, 128, 0);
        f.advance_stage(FlitStage::Sa, stage_time);
        f
    }

    #[test]
    fn lifecycle() {
        let mut vc = VirtualChannel::new();
        assert_eq!(vc.state(), VcState::Idle);
        assert_eq!(vc.enqueue_time(), TICK_INFINITY);

        vc.set_active(5);
        vc.grant_outport(2);
        assert_eq!(vc.state(), VcState::Active);
        assert_eq!(vc.enqueue_time(), 5);
        assert_eq!(vc.outport(), Some(2));

        vc.set_idle(9);
        assert_eq!(vc.outport(), None);
        assert_eq!(vc.outvc(), None);
        assert_eq!(vc.enqueue_time(), TICK_INFINITY);
    }

    #[test]
    fn readiness_waits_for_stage_time() {
        let mut vc = VirtualChannel::new();
        vc.set_active(0);
        vc.insert_flit(data_flit(DataKind::Head, 0, 4));
        assert!(!vc.is_ready(3));
        assert!(vc.is_ready(4));
        assert!(vc.is_ready(10));
    }

    #[test]
    fn complete_packet_detection() {
        let mut vc = VirtualChannel::new();
        vc.set_active(0);
        vc.insert_flit(data_flit(DataKind::Head, 0, 0));
        assert!(!vc.contains_head_and_tail());
        vc.insert_flit(data_flit(DataKind::Body, 1, 0));
        vc.insert_flit(data_flit(DataKind::Tail, 2, 0));
        assert!(vc.contains_head_and_tail());
    }

    #[test]
    fn thaw_is_idempotent() {
        let mut vc = VirtualChannel::new();
        vc.thaw();
        assert!(!vc.is_frozen());
        vc.freeze();
        vc.thaw();
        vc.thaw();
        assert!(!vc.is_frozen());
    }
}
