#![allow(clippy::uninlined_format_args)]

use fraud_scout::aggregate::aggregate;
use fraud_scout::classifier::{ClassifierClient, Scorer};
use fraud_scout::config::Config;
use fraud_scout::policy::decide;

/// Manual check against a running classifier: scores a fixed set of texts,
/// then aggregates them the way a channel sample would be.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fraud-scout.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    println!("Testing classifier at {}", config.classifier_endpoint);
    let client = ClassifierClient::new(&config.classifier_endpoint, config.classifier_timeout())?;

    let samples = [
        "Earn Rs 5000 daily from home, no experience needed. DM now to register!",
        "Instant loan approved in 5 minutes, pay a small processing fee first.",
        "Guaranteed double your deposit in 24 hours, limited slots left.",
        "Tomorrow's match starts at 7pm, tickets at the stadium counter.",
        "The library will be closed on Monday for maintenance.",
    ];

    let mut scores = Vec::new();
    for (i, text) in samples.iter().enumerate() {
        match client.score(text, None).await {
            Ok(score) => {
                println!("\n=== Sample {} ===", i + 1);
                println!("Text: {}", text);
                println!("prob_fraud: {:.4}", score);
                scores.push(score);
            }
            Err(e) => {
                println!("\n=== Sample {} ===", i + 1);
                println!("Text: {}", text);
                println!("❌ Classifier error: {}", e);
                scores.push(0.0);
            }
        }
    }

    let stats = aggregate(&scores)?;
    let verdict = decide(&stats, config.suspicion_threshold);
    println!("\n=== Aggregate ===");
    println!(
        "mean={:.3} median={:.3} p90={:.3} n={}",
        stats.mean, stats.median, stats.p90, stats.count
    );
    if verdict.flagged {
        println!("🚩 Would be flagged: {}", verdict.reason);
    } else {
        println!("✅ Would not be flagged at threshold {}", config.suspicion_threshold);
    }

    Ok(())
}
