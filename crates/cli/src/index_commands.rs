use std::path::Path;

use clap::Subcommand;

use {
    brainproxy_common::TenantId,
    brainproxy_config::BrainProxyConfig,
    brainproxy_memory::{SqliteIndexFactory, search::SearchResult},
};

#[derive(Subcommand)]
pub enum IndexAction {
    /// Keyword search over a tenant's documents or memories.
    Search {
        /// Tenant whose collection to search.
        tenant: String,
        /// The search query.
        query: String,
        /// Maximum number of results to return.
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Search the tenant's memories instead of its documents.
        #[arg(long, default_value_t = false)]
        memory: bool,
        /// Output results as JSON for scripting.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

pub async fn handle_index(action: IndexAction, config: &BrainProxyConfig) -> anyhow::Result<()> {
    match action {
        IndexAction::Search {
            tenant,
            query,
            limit,
            memory,
            json,
        } => {
            let tenant = TenantId::parse(tenant)?;
            let collection = if memory {
                tenant.memory_collection()
            } else {
                tenant.document_collection()
            };
            search(&config.storage.index_db_path(), &collection, &query, limit, json).await
        },
    }
}

/// Open a read-only SQLite connection pool to the index database.
async fn open_index_pool(db_path: &Path) -> anyhow::Result<sqlx::SqlitePool> {
    if !db_path.exists() {
        anyhow::bail!(
            "Index database not found at {}. Start the server first to index documents.",
            db_path.display()
        );
    }
    let db_url = format!("sqlite:{}?mode=ro", db_path.display());
    let pool = sqlx::SqlitePool::connect(&db_url).await?;
    Ok(pool)
}

async fn search(
    db_path: &Path,
    collection: &str,
    query: &str,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let pool = open_index_pool(db_path).await?;
    let index = SqliteIndexFactory::new(pool).index(collection);
    let results = index.keyword_search(query, limit).await?;

    if results.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("No results found in '{collection}'.");
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_human(&results);
    }
    Ok(())
}

fn print_human(results: &[SearchResult]) {
    for (i, r) in results.iter().enumerate() {
        if i > 0 {
            println!();
        }
        let name = r
            .metadata
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&r.id[..12.min(r.id.len())]);
        println!("[{:.2}] {name}", r.score);
        let snippet = r.content.trim();
        let preview: String = snippet.chars().take(200).collect();
        for line in preview.lines() {
            println!("  {line}");
        }
        if snippet.chars().count() > 200 {
            println!("  ...");
        }
    }
}
