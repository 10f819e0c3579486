use anyhow::Result;
use clap::Parser;
use nl_dispatcher::config::SearchConfig;
use nl_dispatcher::demo;
use nl_dispatcher::executor::ExecutionResult;
use nl_dispatcher::llm::HttpGateway;
use nl_dispatcher::{QueryRequest, SearchService};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl-dispatcher")]
#[command(about = "Natural-language search over the demo data set")]
struct Args {
    /// The question to run once; starts an interactive session when omitted
    query: Option<String>,

    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "search_config.json")]
    config: PathBuf,

    /// Search category, e.g. customers, invoices, products
    #[arg(long, default_value = "customers")]
    category: String,

    /// Search this entity type directly instead of a category
    #[arg(long)]
    entity: Option<String>,

    /// Append every result to this file as JSON lines
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// API key (or set NL_DISPATCHER_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Disable the SQL fallback
    #[arg(long)]
    no_sql_fallback: bool,
}

/// 优先使用JSON配置，失败时使用默认配置
fn load_config(args: &Args) -> SearchConfig {
    let mut config = match SearchConfig::from_json_file(&args.config) {
        Ok(config) => {
            info!(path = %args.config.display(), "loaded configuration");
            config
        }
        Err(e) => {
            warn!("无法加载JSON配置文件 ({}), 使用默认配置", e);
            SearchConfig::default()
        }
    }
    .apply_env();

    if let Some(key) = &args.api_key {
        config.llm.api_key = Some(key.clone());
    }
    if args.no_sql_fallback {
        config.sql_fallback = false;
    }
    config
}

fn print_result(result: &ExecutionResult) {
    if let Some(query) = &result.canonical_query {
        println!("[查询]: {}", query);
    }
    match &result.error {
        Some(error) => println!("✗ {}", error),
        None => {
            println!("✅ {} 条 {} 记录", result.count, result.entity_type);
            for record in &result.records {
                println!("  #{:<6} {}", record.id, record.display_name);
            }
            if result.count > result.records.len() {
                println!("  ... 另有 {} 条", result.count - result.records.len());
            }
        }
    }
}

struct Session {
    category: String,
    entity: Option<String>,
}

impl Session {
    fn request(&self, text: &str) -> QueryRequest {
        match &self.entity {
            Some(entity) => QueryRequest::for_entity(text, entity),
            None => QueryRequest::for_category(text, &self.category),
        }
    }
}

async fn run_repl(service: &SearchService, mut session: Session) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("输入问题进行搜索；:category <名称>、:entity <类型>、:history、:quit");

    loop {
        let line = match rl.readline("search> ") {
            Ok(l) => l,
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => continue,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line)?;

        match line.split_once(' ').unwrap_or((line, "")) {
            (":quit" | ":q", _) => break,
            (":category", name) if !name.trim().is_empty() => {
                session.category = name.trim().to_string();
                session.entity = None;
            }
            (":entity", name) if !name.trim().is_empty() => {
                session.entity = Some(name.trim().to_string());
            }
            (":history", _) => {
                for entry in service.audit_entries() {
                    println!("  [{:?}] {} ({})", entry.status, entry.query_text, entry.count);
                }
            }
            (command, _) if command.starts_with(':') => println!("未知命令: {}", command),
            _ => print_result(&service.execute_search(&session.request(line)).await),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args);
    if config.llm.credential().is_none() {
        warn!("no API key configured; every search will fail until one is set");
    }

    let store = demo::seeded_store()?;
    let service = SearchService::new(Arc::new(store), Arc::new(HttpGateway::new()), config);
    let session = Session {
        category: args.category.clone(),
        entity: args.entity.clone(),
    };

    match &args.query {
        Some(text) => print_result(&service.execute_search(&session.request(text)).await),
        None => run_repl(&service, session).await?,
    }

    if let Some(path) = &args.audit_log {
        service.write_audit_log(path)?;
        info!(path = %path.display(), "audit log written");
    }
    Ok(())
}
