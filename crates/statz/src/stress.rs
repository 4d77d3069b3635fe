//! Synthetic load test.
//!
//! Mimics a busy server: every iteration reads a player's travelled
//! distance for one movement type and records a little more of it. The
//! flush ticker runs as usual. At the end everything is flushed and the
//! stored totals are checked against what was sent.

use anyhow::{bail, Result};
use serde::Serialize;
use statz_core::{dimensions, PlayerId, RowRequirement, StatKind, StatzService};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MOVE_TYPES: [&str; 7] = [
    "WALK",
    "FLY",
    "MINECART",
    "PIG IN MINECART",
    "HORSE IN MINECART",
    "PIG",
    "BOAT",
];

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub iterations: u64,
    pub updates: u64,
    pub elapsed_ms: u128,
    pub average_latency_us: f64,
    pub operations_per_second: f64,
    pub expected_total: f64,
    pub stored_total: f64,
}

/// Small deterministic generator so runs are reproducible.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

fn players(count: usize, rng: &mut SplitMix64) -> Vec<PlayerId> {
    (0..count)
        .map(|_| {
            let bytes = ((rng.next() as u128) << 64 | rng.next() as u128).to_be_bytes();
            PlayerId(uuid::Builder::from_random_bytes(bytes).into_uuid())
        })
        .collect()
}

pub async fn run(service: &StatzService, iterations: u64, player_count: usize) -> Result<StressReport> {
    if player_count == 0 {
        bail!("stress test needs at least one player");
    }

    let api = service.api();
    let flusher = service.start();
    let mut rng = SplitMix64(iterations ^ player_count as u64);
    let players = players(player_count, &mut rng);
    let mut expected: HashMap<PlayerId, f64> = HashMap::new();

    info!("Starting stress test: {} iterations over {} players", iterations, player_count);
    let started = Instant::now();
    let mut latency = Duration::ZERO;
    let mut updates = 0u64;

    for i in 0..iterations {
        let player = players[rng.below(players.len())];
        let move_type = MOVE_TYPES[rng.below(MOVE_TYPES.len())];
        let distance = rng.below(5) as f64;
        if distance == 0.0 {
            continue;
        }

        let op_started = Instant::now();
        let filters = [RowRequirement::new("world", "world"), RowRequirement::new("moveType", move_type)];
        let _current = api
            .cached_player_info(player, StatKind::DistanceTravelled, &filters)
            .map(|info| info.total_value());
        api.set_player_info(
            player,
            StatKind::DistanceTravelled,
            dimensions([("moveType", move_type), ("world", "world")]),
            distance,
        )?;
        latency += op_started.elapsed();
        updates += 1;
        *expected.entry(player).or_default() += distance;

        if i % 1000 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let elapsed = started.elapsed();
    flusher.shutdown().await?;

    let mut stored_total = 0.0;
    let mut mismatches = 0;
    for player in &players {
        let stored = api.total(*player, StatKind::DistanceTravelled, &[]).await?;
        let sent = expected.get(player).copied().unwrap_or_default();
        if (stored - sent).abs() > f64::EPSILON {
            debug!("Player {} stored {} but {} was sent", player, stored, sent);
            mismatches += 1;
        }
        stored_total += stored;
    }
    let expected_total: f64 = expected.values().sum();

    let average_latency_us = if updates == 0 {
        0.0
    } else {
        latency.as_secs_f64() * 1_000_000.0 / updates as f64
    };
    let report = StressReport {
        iterations,
        updates,
        elapsed_ms: elapsed.as_millis(),
        average_latency_us,
        operations_per_second: if average_latency_us > 0.0 {
            1_000_000.0 / average_latency_us
        } else {
            0.0
        },
        expected_total,
        stored_total,
    };

    info!("Stress test took {} ms", report.elapsed_ms);
    info!("Average operation took {:.3} us", report.average_latency_us);
    info!("Throughput: {:.0} operations per second", report.operations_per_second);

    if mismatches > 0 {
        bail!(
            "{} players have wrong totals (sent {}, stored {})",
            mismatches,
            expected_total,
            stored_total
        );
    }
    Ok(report)
}
