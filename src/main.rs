// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::Context;
use kestrel_core::EngineEvent;
use kestrel_runtime::Runtime;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Headless single-agent driver: load configuration, spawn the root agent,
/// run one task to completion on stdin (or an explicit prompt argument), and
/// print the transcript to stdout.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut prompt: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            other => prompt = Some(other.to_string()),
        }
    }

    let prompt = match prompt {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        }
    };

    let config = kestrel_config::load(config_path.as_deref()).context("loading configuration")?;
    let (runtime, mut events) = Runtime::bootstrap(config).await.context("bootstrapping runtime")?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    runtime.spawn_root_agent("root").await?;
    let outcome = runtime.run_task("root", prompt, kestrel_core::RunTaskOptions::default()).await?;

    println!("\n--- {:?} after {} iteration(s), {}ms ---", outcome.status, outcome.iterations, outcome.wall_clock_ms);
    println!("{}", outcome.assistant_response);

    runtime.shutdown().await;
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Message { role, content, .. } => println!("[{role:?}] {content}"),
        EngineEvent::StreamChunk { .. } => {}
        EngineEvent::ToolInvocation { name, ok, duration_ms, .. } => {
            println!("[tool] {name} ok={ok} {duration_ms}ms");
        }
        EngineEvent::Status { phase, detail, .. } => println!("[status] {phase} {detail:?}"),
        EngineEvent::Error { kind, message, .. } => eprintln!("[error:{kind}] {message}"),
        EngineEvent::Checkpoint { checkpoint_id, kind, .. } => {
            println!("[checkpoint] {checkpoint_id} ({kind})");
        }
        EngineEvent::HumanMessage { text, message_type } => {
            println!("[human:{message_type}] {text}");
        }
        EngineEvent::TokenUpdate { .. } => {}
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
