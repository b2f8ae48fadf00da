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

//! One output port: mirrors the state of the downstream router's input VCs
//! (idle/active plus a credit count each) and owns the outgoing flit link
//! and the incoming credit link.

use crate::flit::Flit;
use crate::link::{CreditLinkHandle, NetworkLinkHandle};
use crate::routing::PortDirection;
use crate::sim::Scheduler;
use crate::vc::VcState;
use crate::Tick;

#[derive(Debug)]
struct OutVc {
    state: VcState,
    state_time: Tick,
    credits: usize,
}

#[derive(Debug)]
pub struct OutputUnit {
    id: usize,
    direction: PortDirection,
    vcs_per_vnet: usize,
    escape_enabled: bool,
    buffer_depth: usize,
    vcs: Vec<OutVc>,
    out_link: NetworkLinkHandle,
    credit_link: CreditLinkHandle,
    /// Router on the far end of the out link; `None` for Local ports.
    dest_router: Option<usize>,
}

impl OutputUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        direction: PortDirection,
        num_vcs: usize,
        vcs_per_vnet: usize,
        buffer_depth: usize,
        escape_enabled: bool,
        out_link: NetworkLinkHandle,
        credit_link: CreditLinkHandle,
        dest_router: Option<usize>,
    ) -> Self {
        let vcs = (0..num_vcs)
            .map(|_| OutVc {
                state: VcState::Idle,
                state_time: 0,
                credits: buffer_depth,
            })
            .collect();
        Self {
            id,
            direction,
            vcs_per_vnet,
            escape_enabled,
            buffer_depth,
            vcs,
            out_link,
            credit_link,
            dest_router,
        }
    }

    /// Ingest every credit that has arrived by `now`.
    pub fn wakeup(&mut self, now: Tick) {
        loop {
            let credit = {
                let mut link = self.credit_link.borrow_mut();
                if !link.is_ready(now) {
                    break;
                }
                link.consume()
            };
            log::trace!(
                "outport {} credit for vc {} free={}",
                self.id,
                credit.vc,
                credit.is_free
            );
            self.increment_credit(credit.vc);
            if credit.is_free {
                self.set_vc_idle(credit.vc, now);
            }
        }
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn dest_router(&self) -> Option<usize> {
        self.dest_router
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer_depth
    }

    fn is_escape(&self, vc: usize) -> bool {
        self.escape_enabled && vc % self.vcs_per_vnet == 0
    }

    /// Some non-escape VC of `vnet` is idle.
    pub fn has_free_vc(&self, vnet: usize) -> bool {
        let base = vnet * self.vcs_per_vnet;
        (base..base + self.vcs_per_vnet)
            .any(|vc| !self.is_escape(vc) && self.vcs[vc].state == VcState::Idle)
    }

    /// The escape VC of `vnet` is idle and has credits. Escape VCs are
    /// handed out whole: no chaining onto an active escape VC.
    pub fn has_free_escape_vc(&self, vnet: usize) -> bool {
        let vc = vnet * self.vcs_per_vnet;
        self.vcs[vc].state == VcState::Idle && self.vcs[vc].credits > 0
    }

    pub fn has_credit(&self, vc: usize) -> bool {
        self.vcs[vc].credits > 0
    }

    pub fn get_credit_count(&self, vc: usize) -> usize {
        self.vcs[vc].credits
    }

    /// Free credits across `vnet`, excluding the escape VC when reserved.
    pub fn vnet_credits(&self, vnet: usize) -> usize {
        let base = vnet * self.vcs_per_vnet;
        (base..base + self.vcs_per_vnet)
            .filter(|&vc| !self.is_escape(vc))
            .map(|vc| self.vcs[vc].credits)
            .sum()
    }

    /// Claim a free non-escape VC of `vnet`, marking it active.
    pub fn select_free_vc(&mut self, vnet: usize, now: Tick) -> Option<usize> {
        let base = vnet * self.vcs_per_vnet;
        for vc in base..base + self.vcs_per_vnet {
            if !self.is_escape(vc) && self.vcs[vc].state == VcState::Idle {
                self.vcs[vc].state = VcState::Active;
                self.vcs[vc].state_time = now;
                return Some(vc);
            }
        }
        None
    }

    /// Claim the escape VC of `vnet` if it is idle.
    pub fn set_escape_vc(&mut self, vnet: usize, now: Tick) -> Option<usize> {
        let vc = vnet * self.vcs_per_vnet;
        if self.vcs[vc].state == VcState::Idle {
            self.vcs[vc].state = VcState::Active;
            self.vcs[vc].state_time = now;
            Some(vc)
        } else {
            None
        }
    }

    pub fn is_vc_idle(&self, vc: usize, now: Tick) -> bool {
        self.vcs[vc].state == VcState::Idle && now >= self.vcs[vc].state_time
    }

    pub fn set_vc_idle(&mut self, vc: usize, now: Tick) {
        self.vcs[vc].state = VcState::Idle;
        self.vcs[vc].state_time = now;
    }

    pub fn decrement_credit(&mut self, vc: usize) {
        assert!(
            self.vcs[vc].credits > 0,
            "credit underflow on outport {} vc {}",
            self.id,
            vc
        );
        self.vcs[vc].credits -= 1;
    }

    pub fn increment_credit(&mut self, vc: usize) {
        self.vcs[vc].credits += 1;
        assert!(
            self.vcs[vc].credits <= self.buffer_depth,
            "credit overflow on outport {} vc {}",
            self.id,
            vc
        );
    }

    /// Put a flit on the outgoing link, departing at `depart`.
    pub fn send_on_link(&self, flit: Flit, depart: Tick, scheduler: &mut Scheduler) {
        self.out_link.borrow_mut().send(flit, depart, scheduler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{CreditLink, NetworkLink};

    fn unit(escape: bool) -> OutputUnit {
        OutputUnit::new(
            0,
            PortDirection::East,
            4,
            2,
            2,
            escape,
            NetworkLink::new(1, 128),
            CreditLink::new(1, 128),
            Some(1),
        )
    }

    #[test]
    fn escape_vc_is_reserved() {
        let mut out = unit(true);
        // vnet 0: vcs {0 escape, 1}; vnet 1: vcs {2 escape, 3}
        assert!(out.has_free_vc(0));
        assert_eq!(out.select_free_vc(0, 0), Some(1));
        assert!(!out.has_free_vc(0));
        // The escape VC is still free, and exclusively owned once claimed.
        assert!(out.has_free_escape_vc(0));
        assert_eq!(out.set_escape_vc(0, 0), Some(0));
        assert_eq!(out.set_escape_vc(0, 0), None);
        assert!(!out.has_free_escape_vc(0));
    }

    #[test]
    fn without_escape_all_vcs_are_selectable() {
        let mut out = unit(false);
        assert_eq!(out.select_free_vc(0, 0), Some(0));
        assert_eq!(out.select_free_vc(0, 0), Some(1));
        assert_eq!(out.select_free_vc(0, 0), None);
    }

    #[test]
    fn credit_accounting() {
        let mut out = unit(false);
        assert_eq!(out.get_credit_count(1), 2);
        out.decrement_credit(1);
        out.decrement_credit(1);
        assert!(!out.has_credit(1));
        out.increment_credit(1);
        assert_eq!(out.get_credit_count(1), 1);
        assert_eq!(out.vnet_credits(0), 3);
    }

    #[test]
    #[should_panic(expected = "credit underflow")]
    fn credit_underflow_asserts() {
        let mut out = unit(false);
        out.decrement_credit(0);
        out.decrement_credit(0);
        out.decrement_credit(0);
    }

    #[test]
    fn idle_time_gating() {
        let mut out = unit(false);
        assert!(out.is_vc_idle(0, 0));
        let vc = out.select_free_vc(0, 3).unwrap();
        out.set_vc_idle(vc, 7);
        assert!(!out.is_vc_idle(vc, 6));
        assert!(out.is_vc_idle(vc, 7));
    }
}
