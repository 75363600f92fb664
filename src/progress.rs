//! Console output for the recorder
//!
//! Styled header before a recording and a summary after it. Live progress
//! goes through the status reporter's log lines instead.

use crate::config::RecordConfig;
use crate::recorder::{RecordingSummary, SessionPlan};
use crate::source::SourceRole;
use console::style;
use humansize::{format_size, BINARY};

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header at the start of the recording
pub fn print_header(config: &RecordConfig, plan: &SessionPlan) {
    println!();
    println!(
        "{} {}",
        style("mongo-recorder").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}s", style("Duration:").bold(), config.duration.as_secs());
    println!(
        "  {} {}",
        style("Databases:").bold(),
        config.targets.databases.join(", ")
    );
    if let Some(collections) = &config.targets.collections {
        println!("  {} {}", style("Collections:").bold(), collections.join(", "));
    }
    for planned in plan.sources() {
        let label = match planned.source.role() {
            SourceRole::ChangeFeed => "Oplog:",
            SourceRole::Profiler => "Profiler:",
        };
        println!(
            "  {} {} -> {}",
            style(label).bold(),
            planned.source.worker_name(),
            planned.stream.display()
        );
    }
    println!("  {} {}", style("Output:").bold(), plan.output().display());
    println!();
}

/// Print a summary of the recording
pub fn print_summary(summary: &RecordingSummary) {
    let elapsed = (summary.stopped_at - summary.start).num_milliseconds().max(0) as f64 / 1000.0;

    println!();
    if summary.interrupted() {
        println!("{}", style("Recording Interrupted").yellow().bold());
    } else {
        println!("{}", style("Recording Complete").green().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {:.1}s ({})",
        style("Duration:").bold(),
        elapsed,
        summary.reason
    );

    for source in &summary.sources.sources {
        let stream = summary.streams.iter().find(|s| s.key == source.key);
        let size = stream
            .map(|s| format_size(s.bytes, BINARY))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} received {}, written {} ({})",
            style(format!("{}:", source.key)).bold(),
            format_number(source.entries_received),
            format_number(source.entries_written),
            size
        );
    }

    println!(
        "  {} {} queued, {} backpressure waits",
        style("Queue:").bold(),
        format_number(summary.queue.enqueued),
        format_number(summary.queue.backpressure_events)
    );

    if summary.write_failures > 0 {
        println!(
            "  {} {}",
            style("Write failures:").yellow().bold(),
            format_number(summary.write_failures)
        );
    }
    let forced = summary.joins.iter().filter(|j| j.cancelled).count();
    if forced > 0 {
        println!("  {} {}", style("Force-cancelled workers:").yellow().bold(), forced);
    }

    println!(
        "  {} {} records ({} inserts filled, {} unmatched, {} oplog inserts unused)",
        style("Trace:").bold(),
        format_number(summary.merge.records_written),
        format_number(summary.merge.inserts_filled),
        format_number(summary.merge.inserts_unmatched),
        format_number(summary.merge.oplog_inserts_unused)
    );
    println!("  {} {}", style("Output:").bold(), summary.output.display());
    println!();
}
