use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use fraud_scout::classifier::{ClassifierClient, Scorer};
use fraud_scout::config::Config;
use fraud_scout::entity::SourceKind;
use fraud_scout::orchestrator::{Orchestrator, PipelineSettings, RunSummary};
use fraud_scout::rate_gate::RateGate;
use fraud_scout::source::web::read_seed_file;
use fraud_scout::source::{MessagingSource, SourceAdapter, WebSource};
use fraud_scout::store::{DedupCache, MemoryStore, ResultStore, SqliteStore};
use log::LevelFilter;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn cli() -> Command {
    Command::new("fraud-scout")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Discover public channels and web pages that look like fraud")
        .long_about(
            "fraud-scout searches a content source for candidate channels or pages,\n\
             samples their text, scores every item with an external fraud classifier\n\
             and records the entities whose scores cross the suspicion threshold.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("fraud-scout.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load and validate the configuration, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Evaluate without writing to the database")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("score-text")
                .long("score-text")
                .value_name("TEXT")
                .help("Score a single text with the classifier and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("KIND")
                .help("Content source to search: messaging or web")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("keywords")
                .short('k')
                .long("keywords")
                .value_name("QUERY")
                .help("Search queries (messaging) or page URLs (web)")
                .num_args(1..)
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("keywords-file")
                .long("keywords-file")
                .value_name("FILE")
                .help("File with one query (messaging) or page URL (web) per line")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("seeds-file")
                .long("seeds-file")
                .value_name("FILE")
                .help("File with one seed URL per line (web source)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("limit")
                .short('l')
                .long("limit")
                .value_name("N")
                .help("How many channels to try per keyword (messaging)")
                .value_parser(clap::value_parser!(usize))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("sample-size")
                .long("sample-size")
                .value_name("N")
                .help("Maximum text items scored per entity")
                .value_parser(clap::value_parser!(usize))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .value_name("P")
                .help("Suspicion threshold in [0, 1]")
                .value_parser(clap::value_parser!(f64))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("FILE")
                .help("SQLite database path")
                .action(clap::ArgAction::Set),
        )
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(source) = matches.get_one::<String>("source") {
        config.source = SourceKind::parse(source).ok_or_else(|| {
            anyhow::anyhow!("Unknown source '{source}', expected 'messaging' or 'web'")
        })?;
    }
    if let Some(limit) = matches.get_one::<usize>("limit") {
        config.messaging.limit_per_query = *limit;
    }
    if let Some(sample_size) = matches.get_one::<usize>("sample-size") {
        config.sample_size = *sample_size;
    }
    if let Some(threshold) = matches.get_one::<f64>("threshold") {
        config.suspicion_threshold = *threshold;
    }
    if let Some(db) = matches.get_one::<String>("db") {
        config.database_path = db.clone();
    }
    if let Some(seeds) = matches.get_one::<String>("seeds-file") {
        config.web.seeds_file = Some(seeds.clone());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("fraud-scout.yaml");

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = apply_overrides(&mut config, &matches) {
        eprintln!("{e}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        process::exit(1);
    }

    if let Some(text) = matches.get_one::<String>("score-text") {
        score_text(&config, text).await;
        return;
    }

    let cli_keywords: Option<Vec<String>> = matches
        .get_many::<String>("keywords")
        .map(|values| values.cloned().collect());
    let keywords_file = matches.get_one::<String>("keywords-file");

    let queries = match resolve_queries(&config, cli_keywords, keywords_file.map(String::as_str)) {
        Ok(queries) if !queries.is_empty() => queries,
        Ok(_) => {
            eprintln!("No queries to run for the {} source", config.source);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error reading queries: {e:#}");
            process::exit(1);
        }
    };

    let dry_run = matches.get_flag("dry-run");
    let orchestrator = match build_orchestrator(&config, dry_run) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("❌ Startup failed: {e:#}");
            process::exit(1);
        }
    };

    let cancelled = orchestrator.cancellation_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        if cancelled.swap(true, Ordering::SeqCst) {
            log::warn!("Second interrupt, exiting immediately");
            process::exit(130);
        }
        log::info!("Received shutdown signal, stopping after the current entity...");
    }) {
        log::warn!("Failed to install signal handler: {e}");
    }

    log::info!(
        "Starting fraud-scout: source={} queries={} threshold={} sample_size={}{}",
        config.source,
        queries.len(),
        config.suspicion_threshold,
        config.sample_size,
        if dry_run { " (dry run)" } else { "" }
    );

    let summary = orchestrator.run(&queries).await;
    log::info!("Run finished: {summary}");
    print_summary(&summary, &config, dry_run);

    if !summary.completed {
        process::exit(130);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path).with_context(|| format!("Failed to parse {path}"))
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid");
            println!("   Source: {}", config.source);
            println!("   Classifier: {}", config.classifier_endpoint);
            println!("   Threshold: {}", config.suspicion_threshold);
            println!("   Sample size: {}", config.sample_size);
            println!("   Max rate-limit wait: {}s", config.max_rate_limit_wait);
            println!("   Re-check cool-down: {}s", config.recheck_cool_down);
            println!("   Database: {}", config.database_path);
            match config.source {
                SourceKind::Messaging => {
                    println!("   Gateway: {}", config.messaging.gateway_url);
                    println!("   Channels per keyword: {}", config.messaging.limit_per_query);
                    println!("   Keywords: {}", config.keywords.join(", "));
                }
                SourceKind::Web => {
                    println!(
                        "   Seeds file: {}",
                        config.web.seeds_file.as_deref().unwrap_or("(none)")
                    );
                }
            }
        }
        Err(e) => {
            println!("❌ Configuration is invalid: {e}");
            process::exit(1);
        }
    }
}

async fn score_text(config: &Config, text: &str) {
    let client = match ClassifierClient::new(&config.classifier_endpoint, config.classifier_timeout()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    };
    match client.score(text, None).await {
        Ok(score) => {
            let marker = if score >= config.suspicion_threshold {
                "🚩"
            } else {
                "✅"
            };
            println!("{marker} prob_fraud = {score:.4}");
        }
        Err(e) => {
            eprintln!("❌ Classifier call failed: {e}");
            process::exit(1);
        }
    }
}

/// Messaging runs search by keyword; web runs take page URLs. Queries given
/// on the command line win over a queries file, which wins over the config.
fn resolve_queries(
    config: &Config,
    cli_keywords: Option<Vec<String>>,
    keywords_file: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    if let Some(keywords) = cli_keywords {
        return Ok(keywords);
    }
    if let Some(path) = keywords_file {
        return read_seed_file(path);
    }
    match config.source {
        SourceKind::Messaging => Ok(config.keywords.clone()),
        SourceKind::Web => match &config.web.seeds_file {
            Some(path) => read_seed_file(path),
            None => anyhow::bail!("the web source needs a seeds file or --keywords URLs"),
        },
    }
}

fn build_orchestrator(config: &Config, dry_run: bool) -> anyhow::Result<Orchestrator> {
    let source: Arc<dyn SourceAdapter> = match config.source {
        SourceKind::Messaging => Arc::new(MessagingSource::new(
            &config.messaging.gateway_url,
            config.messaging.limit_per_query,
            config.messaging.api_token.clone(),
            Duration::from_secs(config.messaging.request_timeout_secs),
        )?),
        SourceKind::Web => Arc::new(WebSource::new(
            &config.web.user_agent,
            Duration::from_secs(config.web.request_timeout_secs),
            config.web.max_text_length,
        )?),
    };
    let scorer = Arc::new(ClassifierClient::new(
        &config.classifier_endpoint,
        config.classifier_timeout(),
    )?);

    let (cache, results): (Arc<dyn DedupCache>, Arc<dyn ResultStore>) = if dry_run {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    } else {
        let store = Arc::new(
            SqliteStore::open(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );
        log::info!("Using database {}", config.database_path);
        (store.clone(), store)
    };

    Ok(
        Orchestrator::new(source, scorer, cache, results, PipelineSettings::from(config)).with_gates(
            RateGate::new(config.min_request_spacing()).with_max_pause(config.max_rate_limit_wait()),
            RateGate::new(config.classifier_spacing()),
        ),
    )
}

fn print_summary(summary: &RunSummary, config: &Config, dry_run: bool) {
    println!();
    if summary.completed {
        println!("📊 Run complete");
    } else {
        println!("⏹️  Run cancelled");
    }
    println!("   Queries: {}", summary.queries);
    println!(
        "   Candidates: {} ({} duplicates)",
        summary.candidates, summary.duplicates
    );
    println!("   Evaluated: {}", summary.evaluated());
    println!("   🚩 Flagged: {}", summary.flagged);
    println!("   ✅ Clean: {}", summary.clean);
    println!("   ⏭️  Skipped (checked recently): {}", summary.skipped_cool_down);
    println!("   ⏭️  Skipped (no content): {}", summary.skipped_no_content);
    println!("   ⚠️  Skipped (errors): {}", summary.skipped_error);
    if summary.classifier_failures > 0 {
        println!("   ⚠️  Classifier failures scored as 0.0: {}", summary.classifier_failures);
    }
    if summary.persistence_failures > 0 {
        println!("   ❌ Records not stored: {}", summary.persistence_failures);
    }
    if dry_run {
        println!("   (dry run, nothing written)");
    } else {
        println!("   Database: {}", config.database_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn queries_file(lines: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_limit_sets_channels_per_keyword() {
        let matches = cli().try_get_matches_from(["fraud-scout", "--limit", "5"]).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &matches).unwrap();
        assert_eq!(config.messaging.limit_per_query, 5);
        assert_eq!(config.sample_size, 200);
    }

    #[test]
    fn test_sample_size_and_source_overrides() {
        let matches = cli()
            .try_get_matches_from(["fraud-scout", "--sample-size", "50", "--source", "web"])
            .unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &matches).unwrap();
        assert_eq!(config.sample_size, 50);
        assert_eq!(config.messaging.limit_per_query, 20);
        assert_eq!(config.source, SourceKind::Web);

        let matches = cli()
            .try_get_matches_from(["fraud-scout", "--source", "fax"])
            .unwrap();
        assert!(apply_overrides(&mut Config::default(), &matches).is_err());
    }

    #[test]
    fn test_web_source_reads_keywords_file_as_seeds() {
        let mut config = Config::default();
        config.source = SourceKind::Web;
        let file = queries_file("https://a.example/\n# skipped\nhttps://b.example/offer\n");

        let queries = resolve_queries(&config, None, file.path().to_str()).unwrap();
        assert_eq!(queries, vec!["https://a.example/", "https://b.example/offer"]);
    }

    #[test]
    fn test_web_source_without_seeds_is_error() {
        let mut config = Config::default();
        config.source = SourceKind::Web;
        assert!(resolve_queries(&config, None, None).is_err());
    }

    #[test]
    fn test_messaging_query_precedence() {
        let config = Config::default();
        assert_eq!(resolve_queries(&config, None, None).unwrap(), config.keywords);

        let file = queries_file("lottery\n");
        assert_eq!(
            resolve_queries(&config, None, file.path().to_str()).unwrap(),
            vec!["lottery"]
        );
        assert_eq!(
            resolve_queries(&config, Some(vec!["casino".to_string()]), file.path().to_str())
                .unwrap(),
            vec!["casino"]
        );
    }
}
