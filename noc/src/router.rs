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

//! The router proper: input and output units around a two-stage allocator
//! and a crossbar, plus the SPIN deadlock-recovery state machine (whose
//! handlers live in [`crate::spin`]).
//!
//! Within one tick the phase order is fixed: ingest flits on every input,
//! ingest credits on every output, reset the per-cycle SPIN flags, run the
//! counter timeout check (and any pending rotation), then SA-I/SA-II, then
//! switch traversal, then drain the SPIN control queues.

use rand_pcg::Pcg64;
use std::rc::Rc;

use crate::allocator::SwitchAllocator;
use crate::config::NetworkConfig;
use crate::crossbar::CrossbarSwitch;
use crate::error::Error;
use crate::flit::{NetDest, RouteInfo};
use crate::input_unit::InputUnit;
use crate::link::{CreditLinkHandle, NetworkLinkHandle};
use crate::output_unit::OutputUnit;
use crate::routing::{PortDirection, RoutingUnit};
use crate::sim::{ComponentId, Scheduler};
use crate::spin::SpinState;

/// Activity counters collated across the router's subunits.
#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    pub buffer_reads: u64,
    pub buffer_writes: u64,
    pub sw_input_arbiter_activity: u64,
    pub sw_output_arbiter_activity: u64,
    pub crossbar_activity: u64,
    pub ugal_min_choices: u64,
    pub ugal_nonmin_choices: u64,
    pub probes_dropped: u64,
    pub moves_dropped: u64,
    pub check_probes_dropped: u64,
}

pub struct Router {
    pub(crate) id: usize,
    pub(crate) cfg: Rc<NetworkConfig>,
    pub(crate) inputs: Vec<InputUnit>,
    pub(crate) outputs: Vec<OutputUnit>,
    pub(crate) routing: RoutingUnit,
    pub(crate) allocator: SwitchAllocator,
    pub(crate) crossbar: CrossbarSwitch,
    pub(crate) spin: SpinState,
}

impl Router {
    pub fn new(id: usize, cfg: Rc<NetworkConfig>, rng: Pcg64) -> Self {
        let routing = RoutingUnit::new(id, cfg.clone(), rng);
        let allocator = SwitchAllocator::new(&cfg);
        Self {
            id,
            cfg,
            inputs: Vec::new(),
            outputs: Vec::new(),
            routing,
            allocator,
            crossbar: CrossbarSwitch::new(),
            spin: SpinState::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_inports(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outports(&self) -> usize {
        self.outputs.len()
    }

    /// Attach an incoming link (and the matching upstream credit link).
    pub fn add_in_port(
        &mut self,
        direction: PortDirection,
        in_link: NetworkLinkHandle,
        credit_link: CreditLinkHandle,
    ) -> Result<usize, Error> {
        let link_width = in_link.borrow().bit_width();
        if link_width != self.cfg.bit_width {
            return Err(Error::WidthMismatch {
                router: self.id,
                router_width: self.cfg.bit_width,
                link_width,
            });
        }
        let port = self.inputs.len();
        self.inputs.push(InputUnit::new(
            port,
            direction,
            self.cfg.num_vcs(),
            self.cfg.vcs_per_vnet,
            in_link,
            credit_link,
        ));
        self.routing.add_in_port(direction);
        Ok(port)
    }

    /// Attach an outgoing link with its routing-table entry (one
    /// destination set per vnet) and link weight.
    #[allow(clippy::too_many_arguments)]
    pub fn add_out_port(
        &mut self,
        direction: PortDirection,
        out_link: NetworkLinkHandle,
        credit_link: CreditLinkHandle,
        routing_entry: Vec<NetDest>,
        link_weight: i32,
        dest_router: Option<usize>,
    ) -> Result<usize, Error> {
        let link_width = out_link.borrow().bit_width();
        if link_width != self.cfg.bit_width {
            return Err(Error::WidthMismatch {
                router: self.id,
                router_width: self.cfg.bit_width,
                link_width,
            });
        }
        let port = self.outputs.len();
        self.outputs.push(OutputUnit::new(
            port,
            direction,
            self.cfg.num_vcs(),
            self.cfg.vcs_per_vnet,
            self.cfg.buffer_depth,
            self.cfg.escape_vc_enabled,
            out_link,
            credit_link,
            dest_router,
        ));
        self.routing.add_out_port(direction, routing_entry, link_weight);
        Ok(port)
    }

    /// Finish wiring. Call once after all ports are attached.
    pub fn init(&mut self) {
        let num_inports = self.inputs.len();
        let num_outports = self.outputs.len();
        self.allocator.init(num_inports, num_outports);
        self.crossbar.init(num_inports);
        for unit in self.inputs.iter_mut() {
            unit.size_fork_vector(num_outports);
        }
    }

    /// One simulated tick.
    pub fn wakeup(&mut self, scheduler: &mut Scheduler) -> Result<(), Error> {
        let now = scheduler.now();
        log::trace!("router {} woke up at {}", self.id, now);

        for inport in 0..self.inputs.len() {
            self.input_wakeup(inport, scheduler)?;
        }
        for output in self.outputs.iter_mut() {
            output.wakeup(now);
        }

        self.spin.kill_move_processed = false;
        if self.cfg.spin_scheme_enabled {
            self.check_counter_timeout(scheduler)?;
            if self.spin.start_move {
                self.execute_move(scheduler)?;
            }
        }

        {
            let Self {
                id,
                cfg,
                inputs,
                outputs,
                routing,
                allocator,
                crossbar,
                ..
            } = self;
            allocator.wakeup(
                *id, cfg, inputs, outputs, routing, crossbar, now, scheduler,
            )?;
        }
        {
            let Self {
                outputs, crossbar, ..
            } = self;
            crossbar.wakeup(outputs, now, scheduler);
        }

        if self.cfg.spin_scheme_enabled {
            self.drain_control_queues(scheduler);
        }
        Ok(())
    }

    /// Consume at most one flit from an input link and dispatch it.
    fn input_wakeup(&mut self, inport: usize, scheduler: &mut Scheduler) -> Result<(), Error> {
        let now = scheduler.now();
        if !self.inputs[inport].link_ready(now) {
            return Ok(());
        }
        let flit = self.inputs[inport].consume_link();
        log::trace!("router {} inport {} consuming {}", self.id, inport, flit);

        if flit.is_control() {
            self.receive_control_flit(inport, flit, scheduler)?;
        } else {
            let part_of_move = flit.data().part_of_move;
            {
                let Self {
                    id,
                    cfg,
                    inputs,
                    outputs,
                    routing,
                    spin,
                    ..
                } = self;
                inputs[inport]
                    .receive_data_flit(flit, *id, cfg, routing, outputs, spin, now, scheduler)?;
            }
            if part_of_move {
                self.maybe_complete_move(scheduler)?;
            }
        }

        // Another flit already waiting: come back next cycle.
        if self.inputs[inport].link_ready(now) {
            scheduler.schedule(ComponentId::Router(self.id), now + 1);
        }
        Ok(())
    }

    /// Route computation as seen by a freshly arrived head flit.
    pub fn route_compute(
        &mut self,
        route: &RouteInfo,
        inport: usize,
        inport_dirn: PortDirection,
    ) -> Result<usize, Error> {
        let Self {
            outputs, routing, ..
        } = self;
        routing.outport_compute(route, inport, inport_dirn, outputs)
    }

    pub fn outport_direction(&self, outport: usize) -> PortDirection {
        self.routing.out_direction(outport)
    }

    pub fn inport_direction(&self, inport: usize) -> PortDirection {
        self.inputs[inport].direction()
    }

    pub fn input_unit(&self, inport: usize) -> &InputUnit {
        &self.inputs[inport]
    }

    pub fn output_unit(&self, outport: usize) -> &OutputUnit {
        &self.outputs[outport]
    }

    pub fn output_unit_mut(&mut self, outport: usize) -> &mut OutputUnit {
        &mut self.outputs[outport]
    }

    pub fn routing_unit(&self) -> &RoutingUnit {
        &self.routing
    }

    pub fn routing_unit_mut(&mut self) -> &mut RoutingUnit {
        &mut self.routing
    }

    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats {
            sw_input_arbiter_activity: self.allocator.input_arbiter_activity(),
            sw_output_arbiter_activity: self.allocator.output_arbiter_activity(),
            crossbar_activity: self.crossbar.crossbar_activity(),
            ..Default::default()
        };
        let (ugal_min, ugal_nonmin) = self.routing.ugal_choices();
        stats.ugal_min_choices = ugal_min;
        stats.ugal_nonmin_choices = ugal_nonmin;
        for unit in self.inputs.iter() {
            for vnet in 0..self.cfg.num_vnets {
                stats.buffer_reads += unit.buffer_read_activity(vnet);
                stats.buffer_writes += unit.buffer_write_activity(vnet);
            }
            stats.probes_dropped += unit.dropped_probes();
            stats.moves_dropped += unit.dropped_moves();
            stats.check_probes_dropped += unit.dropped_check_probes();
        }
        stats
    }
}
