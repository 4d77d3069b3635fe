//! Newline-delimited JSON front end over the query API.
//!
//! Each stdin line is one request tagged by `op`:
//!
//! ```text
//! {"op":"enqueue","player":"<uuid>","kind":"JOINS","value":1}
//! {"op":"query","player":"<uuid>","kind":"DISTANCE_TRAVELLED","filters":[{"column":"moveType","value":"WALK"}]}
//! {"op":"total","player":"<uuid>","kind":"DEATHS"}
//! {"op":"flush"}
//! {"op":"stats"}
//! {"op":"evict","player":"<uuid>"}
//! ```
//!
//! Each request gets exactly one JSON line back on stdout with an `ok`
//! field; failures carry an `error` message instead of a payload. A `query`
//! reply carries `found: false` when there is nothing to report (only
//! possible for cache-only reads).
//!
//! The loop ends on end of input, on a shutdown signal, or when stdin or
//! stdout fails. Every one of those paths runs the final flush.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use statz_core::{Dimensions, PlayerId, RowRequirement, StatKind, StatValue, StatzService};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::signals::{shutdown_signal, ShutdownSignal};

const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Enqueue {
        player: PlayerId,
        kind: StatKind,
        #[serde(default)]
        dimensions: Dimensions,
        value: StatValue,
    },
    Query {
        player: PlayerId,
        kind: StatKind,
        #[serde(default)]
        filters: Vec<RowRequirement>,
        /// Answer from the cache only, without touching the store.
        #[serde(default)]
        cached: bool,
    },
    Total {
        player: PlayerId,
        kind: StatKind,
        #[serde(default)]
        filters: Vec<RowRequirement>,
    },
    Flush,
    Stats,
    Evict {
        player: PlayerId,
    },
}

fn error_response(message: impl std::fmt::Display) -> Value {
    json!({ "ok": false, "error": message.to_string() })
}

/// Parses and answers a single request line.
pub async fn handle_line(service: &StatzService, line: &str) -> Value {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle_request(service, request).await,
        Err(e) => error_response(format!("invalid request: {e}")),
    }
}

pub async fn handle_request(service: &StatzService, request: Request) -> Value {
    let api = service.api();
    match request {
        Request::Enqueue {
            player,
            kind,
            dimensions,
            value,
        } => match api.set_player_info(player, kind, dimensions, value) {
            Ok(outcome) => json!({ "ok": true, "outcome": format!("{outcome:?}").to_lowercase() }),
            Err(e) => error_response(e),
        },
        Request::Query {
            player,
            kind,
            filters,
            cached,
        } => {
            let info = if cached {
                Ok(api.cached_player_info(player, kind, &filters))
            } else {
                api.get_player_info(player, kind, &filters).await.map(Some)
            };
            match info {
                Ok(Some(info)) => json!({
                    "ok": true,
                    "found": true,
                    "rows": info.records(),
                    "total": info.total_value(),
                    "max": info.max_value(),
                    "text": info.text_value(),
                }),
                Ok(None) => json!({ "ok": true, "found": false, "rows": [] }),
                Err(e) => error_response(e),
            }
        }
        Request::Total { player, kind, filters } => match api.total(player, kind, &filters).await {
            Ok(total) => json!({ "ok": true, "total": total }),
            Err(e) => error_response(e),
        },
        Request::Flush => match api.flush_now().await {
            Ok(report) => json!({ "ok": true, "report": report }),
            Err(e) => error_response(e),
        },
        Request::Stats => {
            let stats = service.stats();
            json!({
                "ok": true,
                "queue": {
                    "pending": stats.queue.pending,
                    "enqueued": stats.queue.enqueued,
                    "coalesced": stats.queue.coalesced,
                    "ignored": stats.queue.ignored,
                    "requeued": stats.queue.requeued,
                },
                "cache": {
                    "entries": stats.cache.entries,
                    "hits": stats.cache.hits,
                    "misses": stats.cache.misses,
                    "loads": stats.cache.loads,
                    "invalidations": stats.cache.invalidations,
                },
                "flush": stats.flush,
            })
        }
        Request::Evict { player } => {
            api.evict_player(player);
            json!({ "ok": true })
        }
    }
}

fn spawn_monitor(service: &StatzService) -> JoinHandle<()> {
    let queue = service.queue().clone();
    let cache = service.cache().clone();
    let scheduler = service.scheduler().clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.tick().await;
        let mut last_persisted = 0u64;

        loop {
            interval.tick().await;
            let queue_stats = queue.stats();
            let cache_stats = cache.stats();
            let flush_stats = scheduler.stats();
            let persisted_this_period = flush_stats.records_persisted - last_persisted;
            last_persisted = flush_stats.records_persisted;

            info!(
                "Statistics health - {} pending | {} persisted/min | {} cached entries ({} hits, {} misses) | {} skipped ticks | {} dropped",
                queue_stats.pending,
                persisted_this_period,
                cache_stats.entries,
                cache_stats.hits,
                cache_stats.misses,
                flush_stats.skipped_ticks,
                flush_stats.records_dropped
            );
            if flush_stats.records_dropped > 0 {
                warn!("{} updates have been lost so far", flush_stats.records_dropped);
            }
        }
    })
}

/// Serves stdin until EOF or a shutdown signal, then runs the final flush.
pub async fn run(service: StatzService) -> Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    serve(&service, input, tokio::io::stdout(), shutdown_signal()).await
}

async fn write_response<W>(output: &mut W, response: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

/// Answers requests read from `input` on `output` until the input ends, the
/// `shutdown` future resolves, or either stream fails.
///
/// Lines that are not valid UTF-8 get an inline error like any other bad
/// request. If `shutdown` fails (signal handlers unavailable) the loop keeps
/// serving until the input ends.
///
/// # Errors
///
/// Returns the final flush's error if it left updates unpersisted,
/// otherwise the stream error that ended the loop, if any. The final flush
/// runs in every case.
pub async fn serve<R, W, S>(service: &StatzService, mut input: R, mut output: W, shutdown: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = Result<ShutdownSignal>>,
{
    let flusher = service.start();
    let monitor = spawn_monitor(service);
    tokio::pin!(shutdown);
    let mut watch_signals = true;
    let mut stream_error = None;
    let mut buf = Vec::new();

    info!("Statz is ready, reading requests from stdin");

    loop {
        buf.clear();
        tokio::select! {
            read = input.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => {
                        info!("Input closed, shutting down");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Reading requests failed, shutting down: {}", e);
                        stream_error = Some(anyhow::Error::new(e).context("Failed to read requests"));
                        break;
                    }
                }

                let response = match std::str::from_utf8(&buf) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => {
                        debug!("Request: {}", line.trim_end());
                        handle_line(service, line.trim_end()).await
                    }
                    Err(e) => {
                        warn!("Rejecting request that is not valid UTF-8: {}", e);
                        error_response(format!("invalid request: {e}"))
                    }
                };
                if let Err(e) = write_response(&mut output, &response).await {
                    error!("Writing a response failed, shutting down: {:#}", e);
                    stream_error = Some(e.context("Failed to write response"));
                    break;
                }
            }
            signal = &mut shutdown, if watch_signals => {
                match signal {
                    Ok(signal) => {
                        info!("Received {}, initiating graceful shutdown", signal);
                        break;
                    }
                    Err(e) => {
                        warn!("Signal handling unavailable, serving until input closes: {:#}", e);
                        watch_signals = false;
                    }
                }
            }
        }
    }

    monitor.abort();
    let report = flusher.shutdown().await.context("Final flush failed")?;

    let stats = service.stats();
    info!(
        "Statz shutdown complete: {} updates persisted in final flush, {} in total, {} dropped",
        report.persisted, stats.flush.records_persisted, stats.flush.records_dropped
    );
    match stream_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
