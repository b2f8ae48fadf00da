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

use std::fmt;

/// Fatal configuration and wiring errors.
///
/// Data-plane invariant violations (a HEAD landing on a non-idle VC, a
/// credit underflow, ...) are implementation bugs and assert instead.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// A link was attached to a router with a different datapath width.
    WidthMismatch {
        router: usize,
        router_width: u32,
        link_width: u32,
    },
    /// The routing table has no candidate outport for a destination.
    NoRoute { router: usize, vnet: usize },
    /// A port index was out of range for the router.
    InvalidPort { router: usize, port: usize },
    /// Malformed network configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::WidthMismatch {
                router,
                router_width,
                link_width,
            } => {
                write!(
                    f,
                    "ERROR: link width {} does not match width {} of router {}",
                    link_width, router_width, router
                )
            }
            Self::NoRoute { router, vnet } => {
                write!(
                    f,
                    "ERROR: no route exists from router {} on vnet {}",
                    router, vnet
                )
            }
            Self::InvalidPort { router, port } => {
                write!(f, "ERROR: invalid port {} on router {}", port, router)
            }
            Self::InvalidConfig(what) => write!(f, "ERROR: invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
