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

//! One input port: owns the virtual channels behind the incoming link,
//! admits data flits into them (with route computation on packet heads),
//! and generates the upstream credits. The SPIN per-VC stall counters and
//! the probe fork vector live here too; control-flit handling that touches
//! router-wide state is on [`crate::router::Router`].

use crate::config::NetworkConfig;
use crate::error::Error;
use crate::flit::{Credit, Flit, FlitStage};
use crate::link::{CreditLinkHandle, NetworkLinkHandle};
use crate::output_unit::OutputUnit;
use crate::routing::{PortDirection, RoutingUnit};
use crate::sim::{ComponentId, Scheduler};
use crate::spin::{CounterState, SpinState};
use crate::vc::{VcState, VirtualChannel};
use crate::Tick;

#[derive(Debug)]
pub struct InputUnit {
    id: usize,
    direction: PortDirection,
    vcs_per_vnet: usize,
    vcs: Vec<VirtualChannel>,
    in_link: NetworkLinkHandle,
    credit_link: CreditLinkHandle,
    stall_count: Vec<u32>,
    fork_vector: Vec<bool>,
    buffer_reads: Vec<u64>,
    buffer_writes: Vec<u64>,
    probes_dropped: u64,
    moves_dropped: u64,
    check_probes_dropped: u64,
}

impl InputUnit {
    pub fn new(
        id: usize,
        direction: PortDirection,
        num_vcs: usize,
        vcs_per_vnet: usize,
        in_link: NetworkLinkHandle,
        credit_link: CreditLinkHandle,
    ) -> Self {
        let num_vnets = num_vcs / vcs_per_vnet;
        Self {
            id,
            direction,
            vcs_per_vnet,
            vcs: (0..num_vcs).map(|_| VirtualChannel::new()).collect(),
            in_link,
            credit_link,
            stall_count: vec![0; num_vcs],
            fork_vector: Vec::new(),
            buffer_reads: vec![0; num_vnets],
            buffer_writes: vec![0; num_vnets],
            probes_dropped: 0,
            moves_dropped: 0,
            check_probes_dropped: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub(crate) fn size_fork_vector(&mut self, num_outports: usize) {
        self.fork_vector = vec![false; num_outports];
    }

    pub fn vc(&self, vc: usize) -> &VirtualChannel {
        &self.vcs[vc]
    }

    pub fn vc_mut(&mut self, vc: usize) -> &mut VirtualChannel {
        &mut self.vcs[vc]
    }

    pub fn num_vcs(&self) -> usize {
        self.vcs.len()
    }

    pub(crate) fn link_ready(&self, now: Tick) -> bool {
        self.in_link.borrow().is_ready(now)
    }

    pub(crate) fn consume_link(&self) -> Flit {
        self.in_link.borrow_mut().consume()
    }

    /// Admit one data flit into its virtual channel. Heads activate the VC
    /// and fix its outport; bodies and tails must find it active.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn receive_data_flit(
        &mut self,
        mut flit: Flit,
        router_id: usize,
        cfg: &NetworkConfig,
        routing: &mut RoutingUnit,
        outputs: &[OutputUnit],
        spin: &mut SpinState,
        now: Tick,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        assert_eq!(
            flit.width(),
            cfg.bit_width,
            "router {} inport {}: flit width mismatch",
            router_id,
            self.id
        );
        flit.data_mut().route.hops_traversed += 1;

        if flit.data().part_of_move {
            return self.receive_move_flit(flit, router_id, routing, outputs, spin, now, scheduler);
        }

        let vc = flit.vc();
        if flit.is_head_kind() {
            assert_eq!(
                self.vcs[vc].state(),
                VcState::Idle,
                "router {} inport {}: HEAD on non-idle vc {}",
                router_id,
                self.id,
                vc
            );
            self.vcs[vc].set_active(now);

            let outport = routing.outport_compute(flit.route(), self.id, self.direction, outputs)?;
            log::trace!(
                "router {} inport {} vc {}: routed packet {} to outport {}",
                router_id,
                self.id,
                vc,
                flit.data().packet_id,
                outport
            );
            self.vcs[vc].grant_outport(outport);

            // A head parked on a through-path is what a deadlock cycle is
            // made of; point the detection counter at the first one seen.
            if cfg.spin_scheme_enabled
                && spin.counter.state == CounterState::Off
                && self.direction != PortDirection::Local
                && routing.out_direction(outport) != PortDirection::Local
            {
                if let Some(at) =
                    spin.set_counter(self.id, vc, CounterState::DeadlockDetection, 0, cfg, now)
                {
                    scheduler.schedule(ComponentId::Router(router_id), at);
                }
            }
        } else {
            assert_eq!(
                self.vcs[vc].state(),
                VcState::Active,
                "router {} inport {}: BODY/TAIL on non-active vc {}",
                router_id,
                self.id,
                vc
            );
        }

        self.bump_buffer_counters(vc);
        self.stage_for_allocation(&mut flit, router_id, cfg, now, scheduler);
        self.vcs[vc].insert_flit(flit);
        Ok(())
    }

    /// A rotated flit from an in-flight deadlock-recovery move. It lands in
    /// the registry VC for this inport; the first arrival also relays our
    /// own registered packet onward along the cycle.
    #[allow(clippy::too_many_arguments)]
    fn receive_move_flit(
        &mut self,
        mut flit: Flit,
        router_id: usize,
        routing: &mut RoutingUnit,
        outputs: &[OutputUnit],
        spin: &mut SpinState,
        now: Tick,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        flit.data_mut().part_of_move = false;

        let entry_idx = spin
            .move_registry
            .iter()
            .position(|e| e.inport == self.id);
        let vc = match entry_idx {
            Some(idx) => {
                // First rotated arrival at a frozen intermediate: send our
                // own registered packet onward before accepting the
                // incoming one. The move's source bursts on its own timer.
                if spin.counter.state == CounterState::Frozen
                    && spin.move_registry[idx].cur_move_count == 0
                {
                    self.relay_move(idx, spin, outputs, now, scheduler)?;
                }
                spin.move_registry[idx].vc
            }
            None => {
                // The move was torn down before its flits finished
                // arriving; fall back to plain admission.
                log::warn!(
                    "router {} inport {}: move flit with no registry entry",
                    router_id,
                    self.id
                );
                flit.vc()
            }
        };

        flit.set_vc(vc);
        if self.vcs[vc].state() == VcState::Idle {
            self.vcs[vc].set_active(now);
        }
        if flit.is_head_kind() {
            // The rotated packet starts over from this router.
            let outport = routing.outport_compute(flit.route(), self.id, self.direction, outputs)?;
            self.vcs[vc].grant_outport(outport);
            self.vcs[vc].clear_outvc();
            self.vcs[vc].set_enqueue_time(now);
        }
        flit.advance_stage(FlitStage::Sa, now);
        self.bump_buffer_counters(vc);
        self.vcs[vc].insert_flit(flit);
        Ok(())
    }

    /// Send the registered packet (front flit through its tail) out the
    /// registry outport. Rotation bypasses switch allocation and credits:
    /// it exchanges flits between buffers that are full on both sides.
    pub(crate) fn relay_move(
        &mut self,
        entry_idx: usize,
        spin: &mut SpinState,
        outputs: &[OutputUnit],
        now: Tick,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        let outport = spin.move_registry[entry_idx].outport;
        let vc = spin.move_registry[entry_idx].vc;
        while let Some(mut flit) = self.vcs[vc].pop_top_flit() {
            let is_tail = flit.is_tail_kind();
            flit.data_mut().part_of_move = true;
            flit.set_outport(outport);
            flit.advance_stage(FlitStage::Lt, now);
            outputs[outport].send_on_link(flit, now + 1, scheduler);
            spin.move_registry[entry_idx].cur_move_count += 1;
            if is_tail {
                spin.move_registry[entry_idx].tail_moved = true;
                break;
            }
        }
        log::debug!(
            "inport {} vc {}: rotated {} flits out outport {}",
            self.id,
            vc,
            spin.move_registry[entry_idx].cur_move_count,
            outport
        );
        Ok(())
    }

    fn bump_buffer_counters(&mut self, vc: usize) {
        let vnet = vc / self.vcs_per_vnet;
        // Writes equal reads: every buffered flit is read exactly once by
        // switch allocation.
        self.buffer_writes[vnet] += 1;
        self.buffer_reads[vnet] += 1;
    }

    fn stage_for_allocation(
        &self,
        flit: &mut Flit,
        router_id: usize,
        cfg: &NetworkConfig,
        now: Tick,
        scheduler: &mut Scheduler,
    ) {
        if cfg.pipe_stages == 1 {
            flit.advance_stage(FlitStage::Sa, now);
        } else {
            let wait = cfg.pipe_stages - 1;
            flit.advance_stage(FlitStage::Sa, now + wait);
            scheduler.schedule(ComponentId::Router(router_id), now + wait);
        }
    }

    /// Queue a credit to the upstream router; it arrives next cycle.
    pub fn send_credit(&self, vc: usize, is_free: bool, now: Tick, scheduler: &mut Scheduler) {
        log::trace!(
            "inport {}: credit for vc {} free={}",
            self.id,
            vc,
            is_free
        );
        self.credit_link
            .borrow_mut()
            .send(Credit::new(vc, is_free, now), now, scheduler);
    }

    /// Count a cycle in which this VC had an allocation-ready head but no
    /// grant. At the detection threshold the VC freezes and is bypassed by
    /// allocation until something thaws it.
    pub fn increment_stall(&mut self, vc: usize, cfg: &NetworkConfig) {
        if !cfg.spin_scheme_enabled || !cfg.escape_vc_enabled {
            return;
        }
        if self.vcs[vc].is_frozen() {
            return;
        }
        // Escape VCs are the guaranteed drain; they never freeze.
        if cfg.escape_vc_enabled && vc % self.vcs_per_vnet == 0 {
            return;
        }
        self.stall_count[vc] += 1;
        if cfg.dd_threshold > 0 && self.stall_count[vc] >= cfg.dd_threshold {
            self.vcs[vc].freeze();
            log::debug!(
                "inport {}: froze vc {} after {} stalled cycles",
                self.id,
                vc,
                self.stall_count[vc]
            );
        }
    }

    pub fn reset_stall(&mut self, vc: usize) {
        self.stall_count[vc] = 0;
    }

    pub fn freeze_vc(&mut self, vc: usize) {
        self.vcs[vc].freeze();
    }

    pub fn thaw_vc(&mut self, vc: usize) {
        self.vcs[vc].thaw();
        self.reset_stall(vc);
    }

    pub fn is_vc_frozen(&self, vc: usize) -> bool {
        self.vcs[vc].is_frozen()
    }

    /// Mark, per distinct outport, the dependencies a probe forks onto.
    /// Every VC of the probe's vnet must be active on a through-path;
    /// otherwise the probe dies here.
    pub(crate) fn create_fork_vector(&mut self, vnet: usize, routing: &RoutingUnit) -> bool {
        for slot in self.fork_vector.iter_mut() {
            *slot = false;
        }
        let base = vnet * self.vcs_per_vnet;
        let mut any = false;
        for vc in base..base + self.vcs_per_vnet {
            if self.vcs[vc].state() != VcState::Active {
                return false;
            }
            let outport = match self.vcs[vc].outport() {
                Some(op) => op,
                None => return false,
            };
            if routing.out_direction(outport) == PortDirection::Local {
                return false;
            }
            self.fork_vector[outport] = true;
            any = true;
        }
        any
    }

    pub(crate) fn fork_vector(&self) -> &[bool] {
        &self.fork_vector
    }

    pub(crate) fn clear_fork_vector(&mut self) {
        for slot in self.fork_vector.iter_mut() {
            *slot = false;
        }
    }

    /// Find the VC of `vnet` a move can rotate: outport matches the path
    /// head and the whole packet is buffered. Any idle or locally-routed VC
    /// in the vnet disqualifies the move.
    pub(crate) fn find_move_vc(
        &self,
        vnet: usize,
        wanted_outport: usize,
        routing: &RoutingUnit,
    ) -> Option<usize> {
        let base = vnet * self.vcs_per_vnet;
        for vc in base..base + self.vcs_per_vnet {
            if self.vcs[vc].state() != VcState::Active {
                return None;
            }
            let outport = self.vcs[vc].outport()?;
            if routing.out_direction(outport) == PortDirection::Local {
                return None;
            }
            if outport == wanted_outport && self.vcs[vc].contains_head_and_tail() {
                return Some(vc);
            }
        }
        None
    }

    pub(crate) fn count_dropped_probe(&mut self) {
        self.probes_dropped += 1;
    }

    pub(crate) fn count_dropped_move(&mut self) {
        self.moves_dropped += 1;
    }

    pub(crate) fn count_dropped_check_probe(&mut self) {
        self.check_probes_dropped += 1;
    }

    pub fn dropped_probes(&self) -> u64 {
        self.probes_dropped
    }

    pub fn dropped_moves(&self) -> u64 {
        self.moves_dropped
    }

    pub fn dropped_check_probes(&self) -> u64 {
        self.check_probes_dropped
    }

    pub fn buffer_read_activity(&self, vnet: usize) -> u64 {
        self.buffer_reads[vnet]
    }

    pub fn buffer_write_activity(&self, vnet: usize) -> u64 {
        self.buffer_writes[vnet]
    }
}
