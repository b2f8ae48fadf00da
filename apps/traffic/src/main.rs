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

//! Drive uniform-random traffic through a mesh and report packet latency.

use std::env;
use std::process;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use noc::topology::build_mesh;
use noc::{NetworkConfig, RoutingAlgorithm};

fn usage() -> ! {
    eprintln!(
        "Usage: <rows> <cols> <packets-per-node> <packet-size> <seed> [table|xy|adaptive|car3d|ugal]"
    );
    process::exit(1);
}

fn parse_algorithm(name: &str) -> RoutingAlgorithm {
    match name {
        "table" => RoutingAlgorithm::Table,
        "xy" => RoutingAlgorithm::Xy,
        "adaptive" => RoutingAlgorithm::Adaptive,
        "car3d" => RoutingAlgorithm::Car3d,
        "ugal" => RoutingAlgorithm::Ugal,
        _ => usage(),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 5 {
        usage();
    }
    let numbers: Vec<u64> = args[..5]
        .iter()
        .map(|arg| {
            let Ok(value) = arg.parse() else { usage() };
            value
        })
        .collect();
    let (rows, cols) = (numbers[0] as usize, numbers[1] as usize);
    let packets_per_node = numbers[2] as usize;
    let packet_size = numbers[3] as usize;
    let seed = numbers[4];
    let algorithm = args
        .get(5)
        .map(|name| parse_algorithm(name))
        .unwrap_or(RoutingAlgorithm::Xy);

    let cfg = NetworkConfig {
        num_rows: rows,
        num_cols: cols,
        routing_algorithm: algorithm,
        ..Default::default()
    };
    let mut net = build_mesh(cfg, seed)?;
    log::info!("built {}x{} mesh with {:?} routing", rows, cols, algorithm);

    let num_nodes = rows * cols;
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut expected = 0;
    for src in 0..num_nodes {
        for _ in 0..packets_per_node {
            let dest = rng.gen_range(0..num_nodes);
            if dest == src {
                continue;
            }
            net.inject(src, dest, 0, packet_size);
            expected += 1;
        }
    }

    // Run in slices so a routing misconfiguration cannot spin forever.
    let mut deadline = 0u64;
    while net.total_received() < expected {
        deadline += 10_000;
        net.run_until(deadline)?;
        if deadline > 10_000_000 {
            anyhow::bail!(
                "network failed to drain: {}/{} packets delivered",
                net.total_received(),
                expected
            );
        }
    }

    let latencies: Vec<u64> = (0..num_nodes)
        .flat_map(|ni| net.interface(ni).received().to_vec())
        .map(|record| record.eject_tick - record.enqueue_tick)
        .collect();
    let mean = latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
    let (min, max) = match latencies.iter().minmax().into_option() {
        Some((lo, hi)) => (*lo, *hi),
        None => (0, 0),
    };
    println!(
        "{} packets delivered by tick {}; latency min/mean/max = {}/{:.1}/{} cycles",
        expected,
        net.now(),
        min,
        mean,
        max
    );
    Ok(())
}
