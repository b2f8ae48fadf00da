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

//! Switch traversal: per-inport winners set by SA-II are pushed onto their
//! granted output links at the next clock edge.

use crate::flit::{Flit, FlitStage};
use crate::output_unit::OutputUnit;
use crate::sim::Scheduler;
use crate::Tick;

#[derive(Debug, Default)]
pub struct CrossbarSwitch {
    winners: Vec<Option<Flit>>,
    crossbar_activity: u64,
}

impl CrossbarSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn init(&mut self, num_inports: usize) {
        self.winners = (0..num_inports).map(|_| None).collect();
    }

    pub fn crossbar_activity(&self) -> u64 {
        self.crossbar_activity
    }

    pub(crate) fn grant_switch(&mut self, inport: usize, flit: Flit) {
        debug_assert!(self.winners[inport].is_none(), "two grants for one inport");
        self.winners[inport] = Some(flit);
    }

    pub(crate) fn wakeup(&mut self, outputs: &[OutputUnit], now: Tick, scheduler: &mut Scheduler) {
        for slot in self.winners.iter_mut() {
            let Some(mut flit) = slot.take() else {
                continue;
            };
            assert!(flit.is_stage(FlitStage::St, now));
            let outport = flit.outport().expect("switch winner without an outport");
            flit.advance_stage(FlitStage::Lt, now + 1);
            outputs[outport].send_on_link(flit, now + 1, scheduler);
            self.crossbar_activity += 1;
        }
    }
}
