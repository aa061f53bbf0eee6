//! Basic SDK usage example: start a research run, tail its resumable
//! stream to completion, and check its final status.
//!
//! Run with: cargo run --example basic_usage

use shiioo_sdk::{RunKind, ShiiooClient, ShiiooResult, StreamEvent};
use std::time::Duration;

#[tokio::main]
async fn main() -> ShiiooResult<()> {
    tracing_subscriber::fmt::init();

    let client = ShiiooClient::builder()
        .base_url("http://localhost:8080")
        .timeout(Duration::from_secs(30))
        .build()?;

    println!("Checking server health...");
    let health = client.health().check().await?;
    println!("Server status: {}", health.status);

    println!("\nStarting a research run...");
    let started = client
        .runs()
        .start("demo-project", RunKind::Research, None)
        .await?;
    println!(
        "Started run {} (workflow_run_id: {:?})",
        started.run_id, started.workflow_run_id
    );

    println!("\nTailing the event stream from index 0...");
    let mut stream = client.runs().stream(started.run_id, 0).await?;
    while let Some(event) = stream.next_event().await? {
        match event {
            StreamEvent::Entry(entry) => {
                println!("  [{}] {:?}", entry.index, entry.payload);
            }
            StreamEvent::Unparsed(raw) => {
                println!("  (skipped unparseable chunk: {raw})");
            }
        }
    }

    if stream.is_interrupted() {
        println!(
            "\nStream was interrupted before [DONE]; cursor at {}",
            stream.cursor()
        );
    } else {
        println!("\nStream closed with [DONE].");
    }

    let summary = client.runs().get(started.run_id).await?;
    println!("\nFinal run status: {:?}", summary.status);

    Ok(())
}
