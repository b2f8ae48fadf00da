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

//! Router-wide state for SPIN deadlock recovery: the single detection
//! counter, the latched path and source-id buffers, the move registry and
//! the four control-flit queues. The handlers that act on this state are
//! on [`crate::router::Router`], where they can reach every input unit.

use std::collections::VecDeque;

use crate::config::NetworkConfig;
use crate::flit::FlitBuffer;
use crate::{Cycles, Tick, TICK_INFINITY};

/// Phase of the router's deadlock counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CounterState {
    Off,
    /// Timing a suspected-stuck VC; timeout launches a probe.
    DeadlockDetection,
    /// A move message for our own cycle is circulating.
    Move,
    /// This router is frozen into someone else's move.
    Frozen,
    /// Our move message came back verified; rotation may start.
    ForwardProgress,
    /// A check-probe round is stabilising the finished move.
    CheckProbe,
}

/// The one counter a router aims at a single (inport, vc) at a time.
#[derive(Debug)]
pub(crate) struct Counter {
    pub inport: usize,
    pub vc: usize,
    pub vnet: usize,
    pub state: CounterState,
    /// Absolute tick at which the current phase times out.
    pub thresh: Tick,
}

/// One frozen VC participating in an in-flight move.
#[derive(Debug, Clone)]
pub(crate) struct MoveInfo {
    pub inport: usize,
    pub vc: usize,
    pub outport: usize,
    pub tail_moved: bool,
    pub cur_move_count: u32,
}

#[derive(Debug)]
pub(crate) struct SpinState {
    pub counter: Counter,
    /// Dependency cycle latched from a verified probe; `None` when invalid.
    pub path_buffer: Option<VecDeque<usize>>,
    /// `(source router, move id)` of the move we are committed to.
    pub source_id_buffer: Option<(usize, u64)>,
    pub move_bit: bool,
    pub start_move: bool,
    pub kill_move_processed: bool,
    /// Estimated round-trip of the latched cycle, in cycles.
    pub loop_delay: Cycles,
    pub probe_queue: FlitBuffer,
    pub move_queue: FlitBuffer,
    pub check_probe_queue: FlitBuffer,
    pub kill_move_queue: FlitBuffer,
    pub move_registry: Vec<MoveInfo>,
    next_msg_id: u64,
}

impl SpinState {
    pub fn new() -> Self {
        Self {
            counter: Counter {
                inport: 0,
                vc: 0,
                vnet: 0,
                state: CounterState::Off,
                thresh: TICK_INFINITY,
            },
            path_buffer: None,
            source_id_buffer: None,
            move_bit: false,
            start_move: false,
            kill_move_processed: false,
            loop_delay: 0,
            probe_queue: FlitBuffer::new(),
            move_queue: FlitBuffer::new(),
            check_probe_queue: FlitBuffer::new(),
            kill_move_queue: FlitBuffer::new(),
            move_registry: Vec::new(),
            next_msg_id: 0,
        }
    }

    pub fn next_msg_id(&mut self) -> u64 {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        id
    }

    /// Re-aim the counter. Returns the timeout tick to schedule a wakeup
    /// at, if the new phase has one.
    pub fn set_counter(
        &mut self,
        inport: usize,
        vc: usize,
        state: CounterState,
        frozen_thresh: Cycles,
        cfg: &NetworkConfig,
        now: Tick,
    ) -> Option<Tick> {
        self.counter.inport = inport;
        self.counter.vc = vc;
        self.counter.vnet = vc / cfg.vcs_per_vnet;
        self.counter.state = state;
        self.counter.thresh = match state {
            CounterState::Move | CounterState::CheckProbe | CounterState::ForwardProgress => {
                now + self.loop_delay.max(1)
            }
            CounterState::Frozen => now + frozen_thresh.max(1),
            CounterState::DeadlockDetection => now + Tick::from(cfg.dd_threshold),
            CounterState::Off => TICK_INFINITY,
        };
        (state != CounterState::Off).then_some(self.counter.thresh)
    }

    pub fn latch_path(&mut self, path: VecDeque<usize>) {
        self.path_buffer = Some(path);
    }

    pub fn peek_path_top(&self) -> Option<usize> {
        self.path_buffer
            .as_ref()
            .and_then(|p| p.front())
            .copied()
    }

    pub fn invalidate_path_buffer(&mut self) {
        self.path_buffer = None;
    }

    pub fn latch_source_id(&mut self, source: usize, move_id: u64) {
        self.source_id_buffer = Some((source, move_id));
    }

    pub fn invalidate_source_id(&mut self) {
        self.source_id_buffer = None;
    }

    pub fn check_source_id(&self, source: usize, move_id: u64) -> bool {
        self.source_id_buffer == Some((source, move_id))
    }

    pub fn partial_check_source_id(&self, source: usize) -> bool {
        matches!(self.source_id_buffer, Some((s, _)) if s == source)
    }

    /// Source router of the move this router is currently committed to:
    /// our own id while we are sourcing one, else the latched claimant.
    pub fn current_claim(&self, my_id: usize) -> Option<usize> {
        match self.counter.state {
            CounterState::Move | CounterState::ForwardProgress | CounterState::CheckProbe => {
                Some(my_id)
            }
            _ => self.source_id_buffer.map(|(s, _)| s),
        }
    }

    pub fn outport_in_registry(&self, outport: usize) -> bool {
        self.move_registry.iter().any(|e| e.outport == outport)
    }

    pub fn registry_entry_by_outport(&self, outport: usize) -> Option<usize> {
        self.move_registry.iter().position(|e| e.outport == outport)
    }

    /// Reset per-move progress on every registry entry.
    pub fn invalidate_move_vcs(&mut self) {
        for entry in self.move_registry.iter_mut() {
            entry.tail_moved = false;
            entry.cur_move_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_thresholds() {
        let cfg = NetworkConfig {
            dd_threshold: 16,
            ..Default::default()
        };
        let mut spin = SpinState::new();

        let at = spin.set_counter(1, 2, CounterState::DeadlockDetection, 0, &cfg, 100);
        assert_eq!(at, Some(116));
        assert_eq!(spin.counter.state, CounterState::DeadlockDetection);

        spin.loop_delay = 10;
        let at = spin.set_counter(1, 2, CounterState::Move, 0, &cfg, 200);
        assert_eq!(at, Some(210));

        let at = spin.set_counter(1, 2, CounterState::Frozen, 1, &cfg, 300);
        assert_eq!(at, Some(301));

        let at = spin.set_counter(1, 2, CounterState::Off, 0, &cfg, 400);
        assert_eq!(at, None);
        assert_eq!(spin.counter.thresh, TICK_INFINITY);
    }

    #[test]
    fn source_id_buffer_checks() {
        let mut spin = SpinState::new();
        assert!(!spin.partial_check_source_id(3));
        spin.latch_source_id(3, 42);
        assert!(spin.check_source_id(3, 42));
        assert!(!spin.check_source_id(3, 41));
        assert!(spin.partial_check_source_id(3));
        spin.invalidate_source_id();
        assert!(!spin.partial_check_source_id(3));
    }

    #[test]
    fn registry_queries() {
        let mut spin = SpinState::new();
        spin.move_registry.push(MoveInfo {
            inport: 0,
            vc: 1,
            outport: 2,
            tail_moved: true,
            cur_move_count: 3,
        });
        assert!(spin.outport_in_registry(2));
        assert!(!spin.outport_in_registry(1));
        spin.invalidate_move_vcs();
        assert!(!spin.move_registry[0].tail_moved);
        assert_eq!(spin.move_registry[0].cur_move_count, 0);
    }
}

// ---------------------------------------------------------------------------
// Router-side SPIN handlers. They live here rather than on the input units
// because probes, moves and kills mutate state across every port of the
// router (the counter, the registry, and frozen VCs on other inports).
// ---------------------------------------------------------------------------

use std::collections::VecDeque as PathQueue;

use crate::error::Error;
use crate::flit::{ControlKind, Flit};
use crate::router::Router;
use crate::routing::PortDirection;
use crate::sim::{ComponentId, Scheduler};
use crate::vc::VcState;

impl Router {
    pub fn counter_state(&self) -> CounterState {
        self.spin.counter.state
    }

    pub fn move_registry_len(&self) -> usize {
        self.spin.move_registry.len()
    }

    pub fn move_bit(&self) -> bool {
        self.spin.move_bit
    }

    pub fn path_buffer_valid(&self) -> bool {
        self.spin.path_buffer.is_some()
    }

    pub fn source_id_buffer_valid(&self) -> bool {
        self.spin.source_id_buffer.is_some()
    }

    fn me(&self) -> ComponentId {
        ComponentId::Router(self.id)
    }

    fn aim_counter(
        &mut self,
        inport: usize,
        vc: usize,
        state: CounterState,
        frozen_thresh: u64,
        scheduler: &mut Scheduler,
    ) {
        let now = scheduler.now();
        if let Some(at) = self
            .spin
            .set_counter(inport, vc, state, frozen_thresh, &self.cfg, now)
        {
            scheduler.schedule(ComponentId::Router(self.id), at);
        }
    }

    pub(crate) fn receive_control_flit(
        &mut self,
        inport: usize,
        flit: Flit,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        if !self.cfg.spin_scheme_enabled {
            log::warn!("router {}: control flit with SPIN disabled, dropped", self.id);
            return Ok(());
        }
        match flit.control().kind {
            ControlKind::Probe => self.receive_probe(inport, flit, scheduler),
            ControlKind::Move => self.receive_move(inport, flit, scheduler),
            ControlKind::CheckProbe => self.receive_check_probe(inport, flit, scheduler),
            ControlKind::KillMove => self.receive_kill_move(inport, flit, scheduler),
        }
    }

    /// True iff the latched path still starts with the outport the counter
    /// VC is waiting on.
    fn verify_latched_dependence(&self) -> bool {
        let Some(expected) = self.spin.peek_path_top() else {
            return false;
        };
        let inport = self.spin.counter.inport;
        let vc = self.spin.counter.vc;
        self.inputs[inport].vc(vc).outport() == Some(expected)
    }

    fn receive_probe(
        &mut self,
        inport: usize,
        flit: Flit,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let source = flit.control().source_router;
        if source == self.id {
            // Our own probe closed a cycle. Commit to a move only when we
            // are not already part of one and the dependence still holds.
            let source_vc = flit.control().source_vc;
            let clean = matches!(
                self.spin.counter.state,
                CounterState::Off | CounterState::DeadlockDetection
            ) && self.spin.source_id_buffer.is_none();
            let dependence = self.inputs[inport].vc(source_vc).outport()
                == flit.control().peek_top()
                && self.inputs[inport].vc(source_vc).contains_head_and_tail();
            if clean && dependence {
                let path = flit.control().path.clone();
                // The kill/move phases must outlive one full circulation.
                self.spin.loop_delay = 2 * (path.len() as u64 + 1);
                self.spin.latch_path(path);
                let move_id = self.send_move_msg(inport, source_vc, scheduler);
                self.spin.latch_source_id(self.id, move_id);
                let first_hop = self.spin.peek_path_top().expect("latched path is empty");
                self.create_move_info_entry(inport, source_vc, first_hop);
                self.aim_counter(inport, source_vc, CounterState::Move, 0, scheduler);
                log::debug!(
                    "router {}: probe verified, move {} launched (loop_delay {})",
                    self.id,
                    move_id,
                    self.spin.loop_delay
                );
            } else {
                self.inputs[inport].count_dropped_probe();
            }
            return Ok(());
        }

        // Intermediate hop.
        if flit.control().num_turns() > self.cfg.spin_max_turn_capacity as usize {
            self.inputs[inport].count_dropped_probe();
            return Ok(());
        }
        if !matches!(
            self.spin.counter.state,
            CounterState::Off | CounterState::DeadlockDetection
        ) {
            // Already committed to a move; don't spread competing probes.
            self.inputs[inport].count_dropped_probe();
            return Ok(());
        }
        let vnet = flit.vnet();
        if self.inputs[inport].create_fork_vector(vnet, &self.routing) {
            self.fork_probes(inport, &flit, scheduler);
        } else {
            self.inputs[inport].count_dropped_probe();
        }
        self.inputs[inport].clear_fork_vector();
        Ok(())
    }

    /// Re-emit a probe out of every outport some VC of its vnet depends on.
    fn fork_probes(&mut self, inport: usize, probe: &Flit, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let outports: Vec<usize> = self.inputs[inport]
            .fork_vector()
            .iter()
            .enumerate()
            .filter(|(_, &marked)| marked)
            .map(|(outport, _)| outport)
            .collect();
        let control = probe.control();
        for outport in outports {
            let mut path = control.path.clone();
            path.push_back(outport);
            let msg_id = self.spin.next_msg_id();
            let mut fork = Flit::new_control(
                ControlKind::Probe,
                msg_id,
                control.source_router,
                control.source_inport,
                control.source_vc,
                probe.vnet(),
                outport,
                path,
                self.cfg.bit_width,
                now,
            );
            fork.control_mut().delay =
                control.delay.saturating_sub(self.cfg.pipe_stages);
            self.spin.probe_queue.insert(fork);
        }
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
    }

    fn receive_move(
        &mut self,
        inport: usize,
        flit: Flit,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let source = flit.control().source_router;
        if source == self.id {
            if self.spin.counter.state == CounterState::Move && self.verify_latched_dependence() {
                self.spin.move_bit = true;
                let vc = flit.control().source_vc;
                self.aim_counter(inport, vc, CounterState::ForwardProgress, 0, scheduler);
                log::debug!("router {}: move confirmed, forward progress", self.id);
            } else {
                self.send_kill_move(inport, scheduler);
                self.spin.invalidate_path_buffer();
                self.spin.invalidate_source_id();
                self.increment_counter_ptr(scheduler);
                self.clear_move_registry(scheduler)?;
                self.inputs[inport].count_dropped_move();
            }
            return Ok(());
        }

        // Intermediate hop: resolve competing claims by source id, lowest
        // winning, so simultaneous recoveries cannot starve each other.
        match self.spin.counter.state {
            CounterState::Off | CounterState::DeadlockDetection => {}
            _ => {
                let claim = self.spin.current_claim(self.id).unwrap_or(usize::MAX);
                if source < claim {
                    self.abort_local_claim(scheduler)?;
                } else if source > claim {
                    self.inputs[inport].count_dropped_move();
                    return Ok(());
                }
            }
        }

        let wanted = match flit.control().peek_top() {
            Some(outport) => outport,
            None => {
                self.inputs[inport].count_dropped_move();
                return Ok(());
            }
        };
        if self.spin.outport_in_registry(wanted) {
            self.inputs[inport].count_dropped_move();
            return Ok(());
        }
        let vnet = flit.vnet();
        match self.inputs[inport].find_move_vc(vnet, wanted, &self.routing) {
            Some(move_vc) => {
                self.spin.move_bit = true;
                self.spin.latch_source_id(source, flit.control().msg_id);
                self.create_move_info_entry(inport, move_vc, wanted);
                self.aim_counter(inport, move_vc, CounterState::Frozen, 1, scheduler);
                self.forward_move(flit, scheduler);
            }
            None => {
                self.inputs[inport].count_dropped_move();
            }
        }
        Ok(())
    }

    fn receive_check_probe(
        &mut self,
        inport: usize,
        flit: Flit,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let source = flit.control().source_router;
        if source == self.id {
            if self.spin.counter.state == CounterState::CheckProbe
                && self.verify_latched_dependence()
            {
                self.spin.move_bit = true;
                let vc = flit.control().source_vc;
                self.aim_counter(inport, vc, CounterState::ForwardProgress, 0, scheduler);
                log::debug!("router {}: check probe confirmed, next rotation", self.id);
            } else {
                self.send_kill_move(inport, scheduler);
                self.spin.invalidate_path_buffer();
                self.spin.invalidate_source_id();
                self.increment_counter_ptr(scheduler);
                self.clear_move_registry(scheduler)?;
                self.inputs[inport].count_dropped_check_probe();
            }
            return Ok(());
        }

        if self.spin.counter.state != CounterState::Frozen
            || !self.spin.partial_check_source_id(source)
        {
            self.inputs[inport].count_dropped_check_probe();
            return Ok(());
        }
        let wanted = match flit.control().peek_top() {
            Some(outport) => outport,
            None => {
                self.inputs[inport].count_dropped_check_probe();
                return Ok(());
            }
        };
        let vnet = flit.vnet();
        match self.inputs[inport].find_move_vc(vnet, wanted, &self.routing) {
            Some(move_vc) => {
                self.spin.move_bit = true;
                self.update_move_info_entry(inport, move_vc, wanted);
                self.aim_counter(inport, move_vc, CounterState::Frozen, 1, scheduler);
                self.forward_check_probe(flit, scheduler);
            }
            None => {
                self.inputs[inport].count_dropped_check_probe();
            }
        }
        Ok(())
    }

    fn receive_kill_move(
        &mut self,
        inport: usize,
        mut flit: Flit,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let source = flit.control().source_router;
        if source == self.id {
            return Ok(());
        }
        if self.spin.partial_check_source_id(source) {
            flit.control_mut().must_send = true;
            self.spin.kill_move_processed = true;
            if self.spin.move_registry.len() == 1 {
                self.spin.move_bit = false;
                self.increment_counter_ptr(scheduler);
                self.spin.invalidate_source_id();
                self.clear_move_registry(scheduler)?;
            } else if let Some(outport) = flit.control().peek_top() {
                self.invalidate_move_registry_entry(outport, scheduler)?;
            }
        } else {
            flit.control_mut().must_send = false;
        }
        self.forward_kill_move(flit, scheduler);
        Ok(())
    }

    /// Yield to a higher-priority move: kill our own circulating move (if
    /// we sourced one), release every frozen VC and go quiet.
    fn abort_local_claim(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        log::debug!("router {}: yielding move claim", self.id);
        if matches!(
            self.spin.counter.state,
            CounterState::Move | CounterState::ForwardProgress | CounterState::CheckProbe
        ) && self.spin.path_buffer.is_some()
        {
            self.send_kill_move(self.spin.counter.inport, scheduler);
        }
        self.spin.invalidate_path_buffer();
        self.spin.invalidate_source_id();
        self.spin.move_bit = false;
        self.spin.start_move = false;
        self.clear_move_registry(scheduler)?;
        let (inport, vc) = (self.spin.counter.inport, self.spin.counter.vc);
        self.aim_counter(inport, vc, CounterState::Off, 0, scheduler);
        Ok(())
    }

    /// Fired by the router wakeup when the counter's phase expires.
    pub(crate) fn check_counter_timeout(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        let now = scheduler.now();
        if self.spin.counter.state == CounterState::Off || now < self.spin.counter.thresh {
            return Ok(());
        }
        match self.spin.counter.state {
            CounterState::DeadlockDetection => {
                self.send_probe(scheduler);
                self.increment_counter_ptr(scheduler);
            }
            CounterState::Move | CounterState::CheckProbe => {
                // The message never came back; tear the move down.
                self.send_kill_move(self.spin.counter.inport, scheduler);
                self.spin.invalidate_path_buffer();
                self.spin.invalidate_source_id();
                self.clear_move_registry(scheduler)?;
                self.increment_counter_ptr(scheduler);
            }
            CounterState::ForwardProgress => {
                let burst_done = self
                    .spin
                    .move_registry
                    .iter()
                    .find(|e| {
                        e.inport == self.spin.counter.inport && e.vc == self.spin.counter.vc
                    })
                    .map(|e| e.cur_move_count > 0)
                    .unwrap_or(true);
                if !burst_done && self.spin.move_bit {
                    self.spin.start_move = true;
                } else {
                    // Rotation never came back around; tear the move down.
                    self.send_kill_move(self.spin.counter.inport, scheduler);
                    self.spin.invalidate_path_buffer();
                    self.spin.invalidate_source_id();
                    self.clear_move_registry(scheduler)?;
                    self.increment_counter_ptr(scheduler);
                }
            }
            CounterState::Frozen => {
                // Held for a foreign move; rotation is relay-driven.
            }
            CounterState::Off => {}
        }
        Ok(())
    }

    /// Aim the counter at the next active through-VC, scanning the rest of
    /// the current inport, then the following non-Local inports, wrapping.
    pub(crate) fn increment_counter_ptr(&mut self, scheduler: &mut Scheduler) {
        let num_vcs = self.cfg.num_vcs();
        let cur_inport = self.spin.counter.inport;
        let cur_vc = self.spin.counter.vc;

        let eligible = |router: &Self, inport: usize, vc: usize| -> bool {
            if router.inputs[inport].direction() == PortDirection::Local {
                return false;
            }
            let channel = router.inputs[inport].vc(vc);
            if channel.state() != VcState::Active {
                return false;
            }
            match channel.outport() {
                Some(outport) => {
                    router.routing.out_direction(outport) != PortDirection::Local
                }
                None => false,
            }
        };

        for vc in cur_vc + 1..num_vcs {
            if eligible(self, cur_inport, vc) {
                self.aim_counter(cur_inport, vc, CounterState::DeadlockDetection, 0, scheduler);
                return;
            }
        }
        let num_inports = self.inputs.len();
        for offset in 1..=num_inports {
            let inport = (cur_inport + offset) % num_inports;
            for vc in 0..num_vcs {
                if eligible(self, inport, vc) {
                    self.aim_counter(inport, vc, CounterState::DeadlockDetection, 0, scheduler);
                    return;
                }
            }
        }
        self.aim_counter(cur_inport, cur_vc, CounterState::Off, 0, scheduler);
    }

    fn control_delay(&self) -> u64 {
        // Round-trip accounting: two loop delays less our own latency.
        (2 * self.spin.loop_delay).saturating_sub(self.cfg.pipe_stages)
    }

    /// Launch a probe carrying the counter VC's outport as its first hop.
    pub(crate) fn send_probe(&mut self, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let inport = self.spin.counter.inport;
        let vc = self.spin.counter.vc;
        let Some(outport) = self.inputs[inport].vc(vc).outport() else {
            return;
        };
        let msg_id = self.spin.next_msg_id();
        let mut probe = Flit::new_control(
            ControlKind::Probe,
            msg_id,
            self.id,
            inport,
            vc,
            self.spin.counter.vnet,
            outport,
            PathQueue::from(vec![outport]),
            self.cfg.bit_width,
            now,
        );
        probe.control_mut().delay = self.control_delay();
        log::debug!(
            "router {}: probing dependence of inport {} vc {} via outport {}",
            self.id,
            inport,
            vc,
            outport
        );
        self.spin.probe_queue.insert(probe);
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
    }

    /// Send the move message for the latched path. Returns its id.
    fn send_move_msg(&mut self, inport: usize, vc: usize, scheduler: &mut Scheduler) -> u64 {
        let now = scheduler.now();
        let mut path = self
            .spin
            .path_buffer
            .clone()
            .expect("move without a latched path");
        let outport = path.pop_front().expect("latched path is empty");
        let msg_id = self.spin.next_msg_id();
        let mut mv = Flit::new_control(
            ControlKind::Move,
            msg_id,
            self.id,
            inport,
            vc,
            vc / self.cfg.vcs_per_vnet,
            outport,
            path,
            self.cfg.bit_width,
            now,
        );
        mv.control_mut().delay = self.control_delay();
        self.spin.move_queue.insert(mv);
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
        msg_id
    }

    fn send_check_probe(&mut self, inport: usize, vc: usize, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let mut path = self
            .spin
            .path_buffer
            .clone()
            .expect("check probe without a latched path");
        let Some(outport) = path.pop_front() else {
            return;
        };
        let msg_id = self.spin.next_msg_id();
        let mut cp = Flit::new_control(
            ControlKind::CheckProbe,
            msg_id,
            self.id,
            inport,
            vc,
            vc / self.cfg.vcs_per_vnet,
            outport,
            path,
            self.cfg.bit_width,
            now,
        );
        cp.control_mut().delay = self.control_delay();
        self.spin.check_probe_queue.insert(cp);
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
    }

    /// Kill the latched move along its path. Mandatory wherever the path
    /// leads; it is what releases frozen VCs downstream.
    pub(crate) fn send_kill_move(&mut self, inport: usize, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let Some(mut path) = self.spin.path_buffer.clone() else {
            return;
        };
        let Some(outport) = path.pop_front() else {
            return;
        };
        let msg_id = self.spin.next_msg_id();
        let vc = self.spin.counter.vc;
        let mut kill = Flit::new_control(
            ControlKind::KillMove,
            msg_id,
            self.id,
            inport,
            vc,
            vc / self.cfg.vcs_per_vnet,
            outport,
            path,
            self.cfg.bit_width,
            now,
        );
        kill.control_mut().must_send = true;
        self.spin.kill_move_queue.insert(kill);
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
    }

    fn forward_move(&mut self, mut flit: Flit, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let pipe = self.cfg.pipe_stages;
        {
            let control = flit.control_mut();
            control.delay = control.delay.saturating_sub(pipe);
        }
        let outport = flit.control_mut().pop_top();
        flit.set_outport(outport);
        flit.set_time(now);
        self.spin.move_queue.insert(flit);
        if pipe > 1 {
            scheduler.schedule(self.me(), now + pipe - 1);
        }
    }

    fn forward_check_probe(&mut self, mut flit: Flit, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let pipe = self.cfg.pipe_stages;
        {
            let control = flit.control_mut();
            control.delay = control.delay.saturating_sub(pipe);
        }
        let outport = flit.control_mut().pop_top();
        flit.set_outport(outport);
        flit.set_time(now);
        self.spin.check_probe_queue.insert(flit);
        if pipe > 1 {
            scheduler.schedule(self.me(), now + pipe - 1);
        }
    }

    fn forward_kill_move(&mut self, mut flit: Flit, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        if flit.control().peek_top().is_none() {
            return;
        }
        let outport = flit.control_mut().pop_top();
        flit.set_outport(outport);
        flit.set_time(now);
        self.spin.kill_move_queue.insert(flit);
        if self.cfg.pipe_stages > 1 {
            scheduler.schedule(self.me(), now + self.cfg.pipe_stages - 1);
        }
    }

    pub(crate) fn create_move_info_entry(&mut self, inport: usize, vc: usize, outport: usize) {
        self.spin.move_registry.push(MoveInfo {
            inport,
            vc,
            outport,
            tail_moved: false,
            cur_move_count: 0,
        });
        self.inputs[inport].freeze_vc(vc);
    }

    /// Re-point the registry entry for `outport` at a different VC, for a
    /// fresh rotation round.
    fn update_move_info_entry(&mut self, inport: usize, vc: usize, outport: usize) {
        let Some(idx) = self.spin.registry_entry_by_outport(outport) else {
            return;
        };
        let old = self.spin.move_registry[idx].clone();
        self.inputs[old.inport].thaw_vc(old.vc);
        let entry = &mut self.spin.move_registry[idx];
        entry.inport = inport;
        entry.vc = vc;
        entry.tail_moved = false;
        entry.cur_move_count = 0;
        self.inputs[inport].freeze_vc(vc);
    }

    fn invalidate_move_registry_entry(
        &mut self,
        outport: usize,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        if let Some(idx) = self.spin.registry_entry_by_outport(outport) {
            let entry = self.spin.move_registry.remove(idx);
            self.thaw_and_refresh(entry.inport, entry.vc, scheduler)?;
        }
        Ok(())
    }

    pub(crate) fn clear_move_registry(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        let entries: Vec<(usize, usize)> = self
            .spin
            .move_registry
            .iter()
            .map(|e| (e.inport, e.vc))
            .collect();
        self.spin.move_registry.clear();
        for (inport, vc) in entries {
            self.thaw_and_refresh(inport, vc, scheduler)?;
        }
        Ok(())
    }

    /// Release a VC from a move. A rotated-in packet starts over: its head
    /// gets a fresh route and re-enters allocation now.
    fn thaw_and_refresh(
        &mut self,
        inport: usize,
        vc: usize,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let now = scheduler.now();
        self.inputs[inport].thaw_vc(vc);

        let front_is_head = self.inputs[inport]
            .vc(vc)
            .peek_top_flit()
            .map(|f| f.is_head_kind());
        match front_is_head {
            None => {
                if self.inputs[inport].vc(vc).state() == VcState::Active {
                    self.inputs[inport].vc_mut(vc).set_idle(now);
                }
                return Ok(());
            }
            Some(true) => {
                let route = self.inputs[inport]
                    .vc(vc)
                    .peek_top_flit()
                    .expect("checked above")
                    .route()
                    .clone();
                let dirn = self.inputs[inport].direction();
                let Self {
                    outputs, routing, ..
                } = self;
                let outport = routing.outport_compute(&route, inport, dirn, outputs)?;
                let channel = self.inputs[inport].vc_mut(vc);
                channel.grant_outport(outport);
                channel.clear_outvc();
                channel.set_enqueue_time(now);
            }
            Some(false) => {
                // Mid-packet: keep the outport it was moving on.
            }
        }
        if let Some(front) = self.inputs[inport].vc_mut(vc).peek_top_flit_mut() {
            front.advance_stage(crate::flit::FlitStage::Sa, now);
        }
        scheduler.schedule(self.me(), now + 1);
        Ok(())
    }

    /// Source-side rotation: burst the registered packet along the cycle,
    /// then hand over to the check-probe round.
    pub(crate) fn execute_move(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        self.spin.start_move = false;
        if self.spin.counter.state != CounterState::ForwardProgress {
            return Ok(());
        }
        let inport = self.spin.counter.inport;
        let vc = self.spin.counter.vc;
        let Some(idx) = self
            .spin
            .move_registry
            .iter()
            .position(|e| e.inport == inport && e.vc == vc)
        else {
            return Ok(());
        };
        if self.spin.move_registry[idx].cur_move_count == 0 {
            let now = scheduler.now();
            {
                let Self {
                    inputs,
                    outputs,
                    spin,
                    ..
                } = self;
                inputs[inport].relay_move(idx, spin, outputs, now, scheduler)?;
            }
            // Completion is announced by the rotated-in tail; if it never
            // arrives, the re-armed threshold tears the move down.
            self.aim_counter(inport, vc, CounterState::ForwardProgress, 0, scheduler);
        }
        Ok(())
    }

    /// Called per rotated-in data flit at a move source: once our burst is
    /// out and the incoming packet is complete, the rotation has gone all
    /// the way around the cycle.
    pub(crate) fn maybe_complete_move(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        if self.spin.counter.state != CounterState::ForwardProgress {
            return Ok(());
        }
        let inport = self.spin.counter.inport;
        let vc = self.spin.counter.vc;
        let rotated = self
            .spin
            .move_registry
            .iter()
            .any(|e| e.inport == inport && e.vc == vc && e.tail_moved);
        if rotated && self.inputs[inport].vc(vc).contains_head_and_tail() {
            self.move_complete(scheduler)?;
        }
        Ok(())
    }

    /// The whole packet has left along the cycle: stabilise with a
    /// check-probe round before rotating again.
    fn move_complete(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        self.spin.start_move = false;
        self.spin.move_bit = false;
        if self.spin.counter.state == CounterState::ForwardProgress {
            assert_eq!(self.spin.move_registry.len(), 1);
            assert_eq!(self.spin.move_registry[0].inport, self.spin.counter.inport);
            assert_eq!(self.spin.move_registry[0].vc, self.spin.counter.vc);
            let inport = self.spin.counter.inport;
            let vc = self.spin.counter.vc;
            self.send_check_probe(inport, vc, scheduler);
            self.aim_counter(inport, vc, CounterState::CheckProbe, 0, scheduler);
            self.clear_move_registry(scheduler)?;
            let first_hop = self
                .spin
                .peek_path_top()
                .expect("check probe without a latched path");
            self.create_move_info_entry(inport, vc, first_hop);
        } else {
            self.spin.invalidate_move_vcs();
        }
        Ok(())
    }

    /// Push every due control flit onto its outport link. Control flits
    /// bypass allocation entirely and consume no credits.
    pub(crate) fn drain_control_queues(&mut self, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        let Self { spin, outputs, .. } = self;
        for queue in [
            &mut spin.kill_move_queue,
            &mut spin.move_queue,
            &mut spin.check_probe_queue,
            &mut spin.probe_queue,
        ] {
            while queue.is_ready(now) {
                let flit = queue.pop().expect("ready queue is empty");
                let outport = flit.outport().expect("control flit without an outport");
                outputs[outport].send_on_link(flit, now, scheduler);
            }
        }
    }
}
