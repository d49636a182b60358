//! Port RPC latency test: request/response and subscription push over an
//! in-process client/router pair.
//!
//! Measures:
//! - round-trip latency of `call` (echo handler, sequential)
//! - delivery latency of subscription pushes (background feed -> callback)
//!
//! Run with:
//!   cargo run --bin port_latency_test

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use wallet_background_router::{
    BackgroundRouter, EventSink, HandlerError, InProcessHost, MessageHandler, SubscriptionHandler,
};
use wallet_port_rpc::service::PortMessageService;

const CALL_ROUNDS: usize = 10_000;
const PUSH_EVENTS: usize = 10_000;

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, request: Value) -> Result<Value, HandlerError> {
        Ok(request)
    }
}

/// Pushes `PUSH_EVENTS` monotonically numbered events as fast as the sink
/// accepts them.
struct Firehose;

#[async_trait]
impl SubscriptionHandler for Firehose {
    async fn subscribe(&self, _request: Value, sink: EventSink) -> Result<Value, HandlerError> {
        tokio::spawn(async move {
            for n in 0..PUSH_EVENTS {
                if !sink.send(json!({ "n": n })) {
                    break;
                }
            }
        });
        Ok(Value::Bool(true))
    }
}

struct LatencyReport {
    call_total: Duration,
    push_total: Duration,
}

impl LatencyReport {
    fn print(&self) {
        let call_us = self.call_total.as_secs_f64() * 1e6 / CALL_ROUNDS as f64;
        let push_us = self.push_total.as_secs_f64() * 1e6 / PUSH_EVENTS as f64;

        println!();
        println!("Port RPC latency (in-process host)");
        println!("----------------------------------");
        println!("  call rounds:        {CALL_ROUNDS}");
        println!("  call avg:           {call_us:>9.2} us/round-trip");
        println!("  push events:        {PUSH_EVENTS}");
        println!("  push avg:           {push_us:>9.2} us/event");
        println!();
    }
}

async fn measure() -> Result<LatencyReport> {
    let mut router = BackgroundRouter::new();
    router.register("pri(echo)", Arc::new(Echo));
    router.register_subscription("pri(firehose.subscribe)", Arc::new(Firehose));
    let service = PortMessageService::new(InProcessHost::new(router));

    // warm up: pays the lazy port setup once, outside the measurement
    service.call("pri(echo)", Some(json!({"warmup": true}))).await?;

    let start = Instant::now();
    for n in 0..CALL_ROUNDS {
        let response = service.call("pri(echo)", Some(json!({ "n": n }))).await?;
        anyhow::ensure!(response == json!({ "n": n }), "echo mismatch at round {n}");
    }
    let call_total = start.elapsed();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    let start = Instant::now();
    let unsub = service.subscribe("pri(firehose.subscribe)", None, move |event| {
        let n = event.get("n").and_then(Value::as_u64).unwrap_or(0) as usize;
        if n + 1 == PUSH_EVENTS {
            let _ = done_tx.send(());
        }
    });
    done_rx
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("firehose ended early"))?;
    let push_total = start.elapsed();
    unsub.unsubscribe().await?;

    Ok(LatencyReport {
        call_total,
        push_total,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let report = measure().await?;
    report.print();
    Ok(())
}
