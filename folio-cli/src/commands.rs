//! CLI subcommand handlers.

use anyhow::{Context, bail};
use folio_core::{
    FolioConfig, IngestRecord, RagService, RagSettings, VectorStore,
    config::DEFAULT_CONFIG_FILE, create_embedder, load_config, open_store,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::client::{self, ApiClient};
use crate::{Commands, ConfigAction};

/// Sample questions sent by `folio check`.
pub const CHECK_QUESTIONS: &[&str] = &[
    "What is the relationship between Brutus and Caesar?",
    "Who is involved in the conspiracy?",
    "What are the main themes in Julius Caesar?",
];

fn resolve_config(path: Option<&Path>) -> anyhow::Result<FolioConfig> {
    load_config(path).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => handle_serve(config_path, host, port).await,
        Commands::Ingest { file, batch_size } => {
            handle_ingest(config_path, &file, batch_size).await
        }
        Commands::Ask { question, url } => handle_ask(config_path, &question, url).await,
        Commands::Check { url } => handle_check(config_path, url).await,
        Commands::Config { action } => handle_config(action, config_path).await,
    }
}

async fn handle_serve(
    config_path: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = resolve_config(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let service = RagService::from_config(&config).await;
    info!(
        store = service.has_store(),
        gemini = service.has_llm(),
        top_k = config.rag.top_k,
        "RAG service initialized"
    );
    folio_core::gateway::run(Arc::new(service), &config.server)
        .await
        .with_context(|| format!("Failed to serve on {}", config.server.addr()))
}

/// Parse one JSON object per non-blank line.
pub fn parse_jsonl(content: &str) -> anyhow::Result<Vec<IngestRecord>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<IngestRecord>(line)
                .with_context(|| format!("Invalid record on line {}", i + 1))
        })
        .collect()
}

async fn handle_ingest(
    config_path: Option<&Path>,
    file: &Path,
    batch_size: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = resolve_config(config_path)?;
    if let Some(batch_size) = batch_size {
        if batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        config.embedding.batch_size = batch_size;
    }

    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records = parse_jsonl(&content)?;
    if records.is_empty() {
        println!("No records found in {}.", file.display());
        return Ok(());
    }

    let store = open_store(&config.store).await;
    match &store {
        Some(store) if store.is_persistent() => {}
        Some(_) => bail!(
            "Could not open the persistent store at {}; refusing to load into memory",
            config.store.location()
        ),
        None => bail!("No vector store is available"),
    }

    let embedding = config.embedding.clone();
    let embedder = tokio::task::spawn_blocking(move || create_embedder(&embedding))
        .await
        .context("Embedder initialization failed")?;

    let service = RagService::new(store, embedder, None, RagSettings::from_config(&config));
    let total = records.len();
    let report = service.ingest(records).await?;

    println!(
        "Loaded {} of {} record(s) into '{}' in {} batch(es); skipped {} blank record(s).",
        report.added, total, config.store.collection_name, report.batches, report.skipped
    );
    Ok(())
}

async fn handle_ask(
    config_path: Option<&Path>,
    question: &str,
    url: Option<String>,
) -> anyhow::Result<()> {
    let config = resolve_config(config_path)?;
    if question.trim().is_empty() {
        bail!("Please enter a query.");
    }
    let base_url = url.unwrap_or_else(|| config.frontend.base_url());
    let api = ApiClient::new(&base_url, config.frontend.timeout_secs)?;

    let response = api.query(question).await?;
    print!("{}", client::render_answer(&response));
    Ok(())
}

async fn handle_check(config_path: Option<&Path>, url: Option<String>) -> anyhow::Result<()> {
    let config = resolve_config(config_path)?;
    let base_url = url.unwrap_or_else(|| config.frontend.base_url());
    let api = ApiClient::new(&base_url, config.frontend.timeout_secs)?;

    println!("Testing backend at: {}", api.base_url());

    // The first call doubles as the reachability probe.
    let health = match api.health().await {
        Ok(health) => health,
        Err(e) => bail!("Cannot reach backend: {e}"),
    };
    println!("\nGET /health");
    print!("{}", client::render_health(&health));

    println!("\nGET /collections");
    match api.collections().await {
        Ok(collections) => print!("{}", client::render_collections(&collections)),
        Err(e) => println!("  [!!] {e}"),
    }

    println!("\nPOST /query");
    for question in CHECK_QUESTIONS {
        println!("  Question: {question}");
        match api.query(question).await {
            Ok(response) => print!("{}", client::render_query_check(&response)),
            Err(e) => println!("  [!!] {e}"),
        }
        println!();
    }
    Ok(())
}

async fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&FolioConfig::default())?;
            std::fs::write(path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = resolve_config(config_path)?;
            let toml_str = toml::to_string_pretty(&config.redacted())?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_skips_blank_lines() {
        let content = r#"
{"id": "jc-1", "text": "Beware the ides of March.", "metadata": {"act": 1, "scene": 2}}

{"text": "Et tu, Brute?"}
"#;
        let records = parse_jsonl(content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("jc-1"));
        assert_eq!(records[0].metadata.get("act"), Some(&serde_json::json!(1)));
        assert!(records[1].id.is_none());
        assert!(records[1].metadata.is_empty());
    }

    #[test]
    fn test_parse_jsonl_reports_line_number() {
        let content = "{\"text\": \"ok\"}\n{\"id\": \"no-text\"}\n";
        let err = parse_jsonl(content).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_default_config_serializes_to_toml() {
        let toml_str = toml::to_string_pretty(&FolioConfig::default().redacted()).unwrap();
        assert!(toml_str.contains("collection_name = \"rag_collection\""));
        assert!(!toml_str.contains("api_key"));
    }

    #[tokio::test]
    async fn test_ingest_into_temp_store() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("chunks.jsonl");
        std::fs::write(
            &data,
            "{\"id\": \"a\", \"text\": \"Friends, Romans, countrymen\"}\n{\"text\": \"  \"}\n",
        )
        .unwrap();
        let config_file = dir.path().join("folio.toml");
        std::fs::write(
            &config_file,
            format!(
                "[store]\npersist_path = \"{}\"\n\n[embedding]\nprovider = \"local\"\n",
                dir.path().join("db").display()
            ),
        )
        .unwrap();

        handle_ingest(Some(&config_file), &data, Some(8)).await.unwrap();

        let store = folio_core::SqliteStore::open(&dir.path().join("db"), "rag_collection").unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
