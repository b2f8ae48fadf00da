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

//! Two-stage separable switch allocation.
//!
//! SA-I picks at most one allocation-ready VC per input port (round-robin),
//! SA-II picks at most one requesting input per output port (round-robin)
//! and performs the downstream VC allocation for packet heads. With escape
//! VCs enabled, escape traffic preempts both stages and blocked heads may
//! fall back onto the escape tree.

use crate::config::NetworkConfig;
use crate::crossbar::CrossbarSwitch;
use crate::error::Error;
use crate::flit::FlitStage;
use crate::input_unit::InputUnit;
use crate::output_unit::OutputUnit;
use crate::routing::RoutingUnit;
use crate::sim::{ComponentId, Scheduler};
use crate::Tick;

#[derive(Debug)]
pub struct SwitchAllocator {
    num_inports: usize,
    num_outports: usize,
    num_vcs: usize,
    vcs_per_vnet: usize,
    rr_invc: Vec<usize>,
    rr_inport: Vec<usize>,
    /// SA-I result: requested outport per inport.
    port_requests: Vec<Option<usize>>,
    /// SA-I result: winning VC per inport.
    vc_winners: Vec<usize>,
    is_escape_req: Vec<bool>,
    /// Grants handed out this tick, for stall bookkeeping.
    granted: Vec<(usize, usize)>,
    input_arbiter_activity: u64,
    output_arbiter_activity: u64,
}

impl SwitchAllocator {
    pub fn new(cfg: &NetworkConfig) -> Self {
        Self {
            num_inports: 0,
            num_outports: 0,
            num_vcs: cfg.num_vcs(),
            vcs_per_vnet: cfg.vcs_per_vnet,
            rr_invc: Vec::new(),
            rr_inport: Vec::new(),
            port_requests: Vec::new(),
            vc_winners: Vec::new(),
            is_escape_req: Vec::new(),
            granted: Vec::new(),
            input_arbiter_activity: 0,
            output_arbiter_activity: 0,
        }
    }

    pub(crate) fn init(&mut self, num_inports: usize, num_outports: usize) {
        self.num_inports = num_inports;
        self.num_outports = num_outports;
        self.rr_invc = vec![0; num_inports];
        self.rr_inport = vec![0; num_outports];
        self.port_requests = vec![None; num_inports];
        self.vc_winners = vec![0; num_inports];
        self.is_escape_req = vec![false; num_inports];
    }

    pub fn input_arbiter_activity(&self) -> u64 {
        self.input_arbiter_activity
    }

    pub fn output_arbiter_activity(&self) -> u64 {
        self.output_arbiter_activity
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn wakeup(
        &mut self,
        router_id: usize,
        cfg: &NetworkConfig,
        inputs: &mut [InputUnit],
        outputs: &mut [OutputUnit],
        routing: &mut RoutingUnit,
        crossbar: &mut CrossbarSwitch,
        now: Tick,
        scheduler: &mut Scheduler,
    ) -> Result<(), Error> {
        self.granted.clear();
        if cfg.escape_vc_enabled {
            self.arbitrate_inports_escape(cfg, inputs, outputs, routing, now)?;
        } else {
            self.arbitrate_inports(cfg, inputs, outputs, now);
        }
        self.arbitrate_outports(
            router_id, cfg, inputs, outputs, routing, crossbar, now, scheduler,
        );
        self.record_stalls(cfg, inputs, now);
        self.clear_requests();
        self.check_for_wakeup(router_id, inputs, now, scheduler);
        Ok(())
    }

    /// SA-I, standard mode: one round-robin winner per input port.
    fn arbitrate_inports(
        &mut self,
        cfg: &NetworkConfig,
        inputs: &[InputUnit],
        outputs: &[OutputUnit],
        now: Tick,
    ) {
        for inport in 0..self.num_inports {
            let start = self.rr_invc[inport];
            for iter in 0..self.num_vcs {
                let invc = (start + iter) % self.num_vcs;
                let vc = inputs[inport].vc(invc);
                if vc.is_frozen() || !vc.is_ready(now) {
                    continue;
                }
                let outport = vc.outport().expect("ready VC without an outport");
                if self.send_allowed(cfg, inputs, outputs, inport, invc, outport, vc.outvc(), now)
                {
                    self.input_arbiter_activity += 1;
                    self.port_requests[inport] = Some(outport);
                    self.vc_winners[inport] = invc;
                    break;
                }
            }
        }
    }

    /// SA-I, escape mode: escape VCs (offset 0 of each vnet) get strict
    /// priority; the remaining VCs round-robin, and a head that cannot get
    /// a regular downstream VC may fall back onto the escape tree.
    fn arbitrate_inports_escape(
        &mut self,
        cfg: &NetworkConfig,
        inputs: &[InputUnit],
        outputs: &[OutputUnit],
        routing: &mut RoutingUnit,
        now: Tick,
    ) -> Result<(), Error> {
        for inport in 0..self.num_inports {
            let mut picked = false;

            for invc in (0..self.num_vcs).step_by(self.vcs_per_vnet) {
                let vc = inputs[inport].vc(invc);
                if vc.is_frozen() || !vc.is_ready(now) {
                    continue;
                }
                // A continuing escape packet keeps its granted VC; a fresh
                // head is routed over the tree.
                let (outport, outvc) = match vc.outvc() {
                    Some(v) => (vc.outport().expect("granted VC without outport"), Some(v)),
                    None => {
                        let route = vc.peek_top_flit().expect("ready VC is empty").route().clone();
                        let dirn = routing.in_direction(inport);
                        (routing.escape_route_compute(&route, inport, dirn)?, None)
                    }
                };
                if self.send_allowed(cfg, inputs, outputs, inport, invc, outport, outvc, now) {
                    self.input_arbiter_activity += 1;
                    self.port_requests[inport] = Some(outport);
                    self.vc_winners[inport] = invc;
                    self.is_escape_req[inport] = true;
                    picked = true;
                    break;
                }
            }
            if picked {
                continue;
            }

            let mut start = self.rr_invc[inport];
            if start % self.vcs_per_vnet == 0 {
                start += 1;
            }
            let mut invc = start;
            for _ in 0..self.num_vcs {
                if invc >= self.num_vcs {
                    invc = 0;
                }
                if invc % self.vcs_per_vnet == 0 {
                    invc += 1;
                    continue;
                }
                let vc = inputs[inport].vc(invc);
                if vc.is_frozen() || !vc.is_ready(now) {
                    invc += 1;
                    continue;
                }
                let outport = vc.outport().expect("ready VC without an outport");
                let outvc = vc.outvc();
                if self.send_allowed(cfg, inputs, outputs, inport, invc, outport, outvc, now) {
                    self.input_arbiter_activity += 1;
                    self.port_requests[inport] = Some(outport);
                    self.vc_winners[inport] = invc;
                    break;
                }
                // Head with no regular VC downstream: try the escape tree.
                // SA-II re-verifies before allocating the escape VC.
                if outvc.is_none() {
                    let route = vc.peek_top_flit().expect("ready VC is empty").route().clone();
                    let dirn = routing.in_direction(inport);
                    let esc_outport = routing.escape_route_compute(&route, inport, dirn)?;
                    let esc_vc = (invc / self.vcs_per_vnet) * self.vcs_per_vnet;
                    if outputs[esc_outport].is_vc_idle(esc_vc, now) {
                        self.input_arbiter_activity += 1;
                        self.port_requests[inport] = Some(esc_outport);
                        self.vc_winners[inport] = invc;
                        self.is_escape_req[inport] = true;
                        break;
                    }
                }
                invc += 1;
            }
        }
        Ok(())
    }

    /// A flit may be sent iff a downstream VC (heads) or a credit (bodies)
    /// is available, and sending would not overtake an older flit bound
    /// for the same outport within an ordered vnet.
    #[allow(clippy::too_many_arguments)]
    fn send_allowed(
        &self,
        cfg: &NetworkConfig,
        inputs: &[InputUnit],
        outputs: &[OutputUnit],
        inport: usize,
        invc: usize,
        outport: usize,
        outvc: Option<usize>,
        now: Tick,
    ) -> bool {
        let vnet = invc / self.vcs_per_vnet;
        let allowed = match outvc {
            Some(v) => outputs[outport].has_credit(v),
            None => {
                if cfg.escape_vc_enabled && invc % self.vcs_per_vnet == 0 {
                    outputs[outport].has_free_escape_vc(vnet)
                } else {
                    outputs[outport].has_free_vc(vnet)
                }
            }
        };
        if !allowed {
            return false;
        }

        if cfg.is_vnet_ordered(vnet) {
            let unit = &inputs[inport];
            let enqueue_time = unit.vc(invc).enqueue_time();
            let base = vnet * self.vcs_per_vnet;
            for offset in 0..self.vcs_per_vnet {
                let other = base + offset;
                if unit.vc(other).is_ready(now)
                    && unit.vc(other).outport() == Some(outport)
                    && unit.vc(other).enqueue_time() < enqueue_time
                {
                    return false;
                }
            }
        }
        true
    }

    /// SA-II: per output port, prefer escape requesters, then round-robin.
    /// The winner gets its downstream VC (heads), spends a credit, and
    /// moves to switch traversal; tails retire the input VC.
    #[allow(clippy::too_many_arguments)]
    fn arbitrate_outports(
        &mut self,
        router_id: usize,
        cfg: &NetworkConfig,
        inputs: &mut [InputUnit],
        outputs: &mut [OutputUnit],
        routing: &mut RoutingUnit,
        crossbar: &mut CrossbarSwitch,
        now: Tick,
        scheduler: &mut Scheduler,
    ) {
        for outport in 0..self.num_outports {
            let start = self.rr_inport[outport];
            let mut chosen = None;
            for iter in 0..self.num_inports {
                let inport = (start + iter) % self.num_inports;
                if self.port_requests[inport] == Some(outport) && self.is_escape_req[inport] {
                    chosen = Some(inport);
                    break;
                }
            }
            if chosen.is_none() {
                for iter in 0..self.num_inports {
                    let inport = (start + iter) % self.num_inports;
                    if self.port_requests[inport] == Some(outport) {
                        chosen = Some(inport);
                        break;
                    }
                }
            }
            let Some(inport) = chosen else {
                continue;
            };

            let invc = self.vc_winners[inport];
            let vnet = invc / self.vcs_per_vnet;
            let outvc = match inputs[inport].vc(invc).outvc() {
                Some(v) => v,
                None => {
                    let allocated = if self.is_escape_req[inport] && cfg.escape_vc_enabled {
                        outputs[outport].set_escape_vc(vnet, now)
                    } else {
                        outputs[outport].select_free_vc(vnet, now)
                    };
                    match allocated {
                        Some(v) => {
                            inputs[inport].vc_mut(invc).grant_outvc(v);
                            v
                        }
                        None if self.is_escape_req[inport] => {
                            // The escape VC was claimed between SA-I and
                            // here; drop the request and retry next cycle.
                            log::debug!(
                                "router {}: escape allocation lost for inport {} vc {}",
                                router_id,
                                inport,
                                invc
                            );
                            self.port_requests[inport] = None;
                            continue;
                        }
                        None => panic!(
                            "router {}: VC allocation failed after send_allowed approved it",
                            router_id
                        ),
                    }
                }
            };

            let mut flit = inputs[inport]
                .vc_mut(invc)
                .pop_top_flit()
                .expect("ready VC is empty");
            flit.set_outport(outport);
            flit.set_vc(outvc);
            outputs[outport].decrement_credit(outvc);
            routing.update_ewma(outport, vnet, outputs[outport].vnet_credits(vnet));
            flit.advance_stage(FlitStage::St, now);
            log::debug!(
                "router {}: granted outport {} outvc {} to inport {} vc {} ({})",
                router_id,
                outport,
                outvc,
                inport,
                invc,
                flit
            );

            let is_tail = flit.is_tail_kind();
            crossbar.grant_switch(inport, flit);
            self.output_arbiter_activity += 1;

            if is_tail {
                assert!(
                    inputs[inport].vc(invc).is_empty(),
                    "router {}: tail left a non-empty VC behind",
                    router_id
                );
                inputs[inport].vc_mut(invc).set_idle(now);
                inputs[inport].send_credit(invc, true, now, scheduler);
            } else {
                inputs[inport].send_credit(invc, false, now, scheduler);
            }

            inputs[inport].reset_stall(invc);
            self.granted.push((inport, invc));
            self.port_requests[inport] = None;
            self.rr_inport[outport] = (inport + 1) % self.num_inports;
            self.rr_invc[inport] = (invc + 1) % self.num_vcs;
        }
    }

    /// Charge a stalled cycle to every allocation-ready VC that got no
    /// grant this tick.
    fn record_stalls(&mut self, cfg: &NetworkConfig, inputs: &mut [InputUnit], now: Tick) {
        if !cfg.spin_scheme_enabled || !cfg.escape_vc_enabled {
            return;
        }
        for inport in 0..self.num_inports {
            for vc in 0..self.num_vcs {
                if inputs[inport].vc(vc).is_frozen() {
                    continue;
                }
                if inputs[inport].vc(vc).is_ready(now) && !self.granted.contains(&(inport, vc)) {
                    inputs[inport].increment_stall(vc, cfg);
                }
            }
        }
    }

    fn clear_requests(&mut self) {
        for request in self.port_requests.iter_mut() {
            *request = None;
        }
        for escape in self.is_escape_req.iter_mut() {
            *escape = false;
        }
    }

    /// Re-run allocation next cycle if anything will be ready for it.
    fn check_for_wakeup(
        &self,
        router_id: usize,
        inputs: &[InputUnit],
        now: Tick,
        scheduler: &mut Scheduler,
    ) {
        let next = now + 1;
        let me = ComponentId::Router(router_id);
        if scheduler.already_scheduled(me, next) {
            return;
        }
        for unit in inputs.iter() {
            for vc in 0..self.num_vcs {
                if !unit.vc(vc).is_frozen() && unit.vc(vc).is_ready(next) {
                    scheduler.schedule(me, next);
                    return;
                }
            }
        }
    }
}
