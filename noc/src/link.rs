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

//! Point-to-point links between components.
//!
//! A link is a FIFO whose entries become visible to the consumer at their
//! stamped arrival time. Sending also schedules the consumer's wakeup, so
//! links are never ticked themselves. Producer and consumer each hold a
//! shared handle.

use std::cell::RefCell;
use std::rc::Rc;

use crate::flit::{Credit, Flit};
use crate::sim::{ComponentId, Scheduler};
use crate::{Cycles, Tick};

/// Items a link can carry: anything with a scheduling timestamp.
pub trait Timestamped {
    fn time(&self) -> Tick;
    fn set_time(&mut self, time: Tick);
}

impl Timestamped for Flit {
    fn time(&self) -> Tick {
        Flit::time(self)
    }

    fn set_time(&mut self, time: Tick) {
        Flit::set_time(self, time)
    }
}

impl Timestamped for Credit {
    fn time(&self) -> Tick {
        self.time
    }

    fn set_time(&mut self, time: Tick) {
        self.time = time;
    }
}

#[derive(Debug)]
pub struct Link<T: Timestamped> {
    latency: Cycles,
    bit_width: u32,
    consumer: Option<ComponentId>,
    buffer: std::collections::VecDeque<T>,
}

impl<T: Timestamped> Link<T> {
    pub fn new(latency: Cycles, bit_width: u32) -> Rc<RefCell<Self>> {
        assert!(latency >= 1, "links have a minimum latency of one cycle");
        Rc::new(RefCell::new(Self {
            latency,
            bit_width,
            consumer: None,
            buffer: std::collections::VecDeque::new(),
        }))
    }

    pub fn set_consumer(&mut self, consumer: ComponentId) {
        self.consumer = Some(consumer);
    }

    pub fn latency(&self) -> Cycles {
        self.latency
    }

    pub fn bit_width(&self) -> u32 {
        self.bit_width
    }

    /// True iff an item has arrived by `now`.
    pub fn is_ready(&self, now: Tick) -> bool {
        self.buffer.front().map(|i| i.time() <= now).unwrap_or(false)
    }

    pub fn consume(&mut self) -> T {
        self.buffer.pop_front().expect("consume on an empty link")
    }

    /// Put `item` on the wire at `depart`; it arrives `latency` cycles
    /// later and the consumer is woken at that tick.
    pub fn send(&mut self, mut item: T, depart: Tick, scheduler: &mut Scheduler) {
        let arrival = depart + self.latency;
        item.set_time(arrival);
        debug_assert!(self
            .buffer
            .back()
            .map(|b| b.time() <= arrival)
            .unwrap_or(true));
        self.buffer.push_back(item);
        if let Some(consumer) = self.consumer {
            scheduler.schedule(consumer, arrival);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Downstream-flowing flit link.
pub type NetworkLink = Link<Flit>;
/// Upstream-flowing credit link.
pub type CreditLink = Link<Credit>;

pub type NetworkLinkHandle = Rc<RefCell<NetworkLink>>;
pub type CreditLinkHandle = Rc<RefCell<CreditLink>>;
