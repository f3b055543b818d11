// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic paper-sync usage example.
//!
//! Demonstrates:
//! 1. Building the service over an in-memory fast tier and a SQLite file
//! 2. Signing up users (registry pre-check + durable constraint)
//! 3. Uploading papers and searching them (read-through cache)
//! 4. Viewing papers (fast-tier counters) and reconciling them
//! 5. Displaying metrics
//! 6. Clean shutdown (final sweep)
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Instant;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use paper_sync::records::{NewPaper, NewUser};
use paper_sync::search::SearchQuery;
use paper_sync::storage::memory::InMemoryFastStore;
use paper_sync::storage::sql::SqlStore;
use paper_sync::storage::traits::DurableStore;
use paper_sync::{PaperService, PaperSyncConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             paper-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Build the service
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Opening tiers...");
    let dir = tempfile::tempdir()?;
    let sql_url = format!("sqlite://{}?mode=rwc", dir.path().join("papers.db").display());

    let config = PaperSyncConfig {
        view_sync_interval_secs: 3600,
        ..Default::default()
    };
    let durable = Arc::new(SqlStore::new(&sql_url).await?);
    let service = PaperService::new(Arc::new(InMemoryFastStore::new()), durable.clone(), &config);
    service.start()?;
    println!("   ✅ Ready (fast: in-memory, durable: {})", sql_url);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Users
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n👤 Signing up...");
    let ada = service
        .signup(NewUser {
            username: "Ada".into(),
            name: "Ada Lovelace".into(),
            email: "ada@example.org".into(),
            password_hash: "$argon2id$demo".into(),
            department: "Mathematics".into(),
        })
        .await?;
    println!("   └─ Created {} ({})", ada.username, ada.id);

    let retry = service
        .signup(NewUser {
            username: "ada".into(),
            name: "Someone Else".into(),
            email: "other@example.org".into(),
            password_hash: "$argon2id$demo".into(),
            department: "Physics".into(),
        })
        .await;
    println!("   └─ Second 'ada': {:?}", retry.map(|u| u.username));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Papers and search
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Uploading papers...");
    let mut ids = Vec::new();
    for (title, keywords, date) in [
        ("Notes on the Analytical Engine", vec!["computation", "engines"], "1843-10-01"),
        ("Counting views at scale", vec!["counters", "redis"], "2024-02-01"),
        ("Caching search results", vec!["cache", "redis"], "2023-06-12"),
    ] {
        let paper = service
            .upload_paper(
                NewPaper {
                    title: title.into(),
                    authors: vec!["Ada Lovelace".into()],
                    abstract_text: format!("An essay on {}.", keywords.join(" and ")),
                    publication_date: date.into(),
                    journal_conference: None,
                    keywords: keywords.into_iter().map(String::from).collect(),
                },
                &ada.id,
            )
            .await?;
        println!("   └─ {} → {}", paper.title, paper.id);
        ids.push(paper.id);
    }

    println!("\n🔍 Searching 'redis' twice...");
    let query = SearchQuery::from_params(Some("Redis"), Some("publication_date"), Some("desc"))?;
    for attempt in 1..=2 {
        let start = Instant::now();
        let results = service.search_papers(&query).await?;
        let titles: Vec<_> = results.papers.iter().map(|p| p.title.as_str()).collect();
        println!("   └─ #{} {:?} ({:?})", attempt, titles, start.elapsed());
    }
    let stats = service.search_cache_stats();
    println!("   ⚡ Cache: {} hit / {} miss", stats.hits, stats.misses);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Views and reconciliation
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n👀 Viewing '{}' 3 times...", ids[1]);
    for _ in 0..3 {
        let viewed = service.view_paper(&ids[1]).await?;
        println!(
            "   └─ total {} (durable {} + pending {:?})",
            viewed.views.total(),
            viewed.views.baseline,
            viewed.views.pending
        );
    }

    println!("\n🔄 Reconciling now...");
    let report = service.scheduler().sweep_now().await?;
    println!(
        "   └─ scanned {} synced {} cleared {} in {:?}",
        report.keys_scanned, report.items_synced, report.keys_cleared, report.elapsed
    );
    if let Some(paper) = durable.get_paper(&ids[1]).await? {
        println!("   └─ Durable views now: {}", paper.views);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    service.view_paper(&ids[0]).await?;
    service.shutdown().await;
    if let Some(paper) = durable.get_paper(&ids[0]).await? {
        println!("   ✅ Final sweep flushed '{}' → {} views", paper.title, paper.views);
    }

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{} = {}", label_str, v),
            DebugValue::Gauge(v) => format!("{} = {:.2}", label_str, v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("{} count={} sum={:.4}", label_str, count, sum)
            }
        };
        lines.push(format!("{}{}", key.name(), rendered));
    }

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
