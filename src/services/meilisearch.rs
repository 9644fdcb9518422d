//! Meilisearch-backed search index

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use meilisearch_sdk::{
    client::Client,
    indexes::Index,
    search::{MatchingStrategies, Selectors},
    settings::Settings,
    task_info::TaskInfo,
};
use serde_json::Value;

use crate::{
    config::SearchConfig,
    error::{AppError, AppResult},
};

use super::search::{
    BookDocument, MatchMode, SearchHit, SearchIndex, SearchPage, SearchQuery, HIGHLIGHT_POST_TAG,
    HIGHLIGHT_PRE_TAG, SEARCHABLE_FIELDS,
};

const PRIMARY_KEY: &str = "id";
const REINDEX_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct MeiliSearchIndex {
    client: Client,
    uid: String,
}

fn degraded(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::DependencyDegraded(format!("{}: {}", context, e))
}

impl MeiliSearchIndex {
    pub fn new(config: &SearchConfig) -> AppResult<Self> {
        let client = Client::new(config.url.as_str(), config.api_key.as_deref())
            .map_err(|e| AppError::Internal(format!("Failed to create search client: {}", e)))?;

        Ok(Self {
            client,
            uid: config.index.clone(),
        })
    }

    fn index_handle(&self) -> Index {
        self.client.index(&self.uid)
    }

    async fn wait(&self, task: TaskInfo, context: &str) -> AppResult<()> {
        let task = task
            .wait_for_completion(&self.client, None, Some(REINDEX_TIMEOUT))
            .await
            .map_err(|e| degraded(context, e))?;
        if task.is_failure() {
            return Err(AppError::DependencyDegraded(format!("{}: task failed", context)));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MeiliSearchIndex {
    async fn ensure_index(&self) -> AppResult<()> {
        if self.client.get_index(&self.uid).await.is_err() {
            let task = self
                .client
                .create_index(&self.uid, Some(PRIMARY_KEY))
                .await
                .map_err(|e| degraded("Failed to create search index", e))?;
            self.wait(task, "Failed to create search index").await?;
            tracing::info!("Created search index {}", self.uid);
        }

        let settings = Settings::new()
            .with_searchable_attributes(SEARCHABLE_FIELDS)
            .with_filterable_attributes(["status", "author", "price"])
            .with_sortable_attributes(["price", "publish_date"]);
        let task = self
            .index_handle()
            .set_settings(&settings)
            .await
            .map_err(|e| degraded("Failed to apply search index settings", e))?;
        self.wait(task, "Failed to apply search index settings").await
    }

    async fn index(&self, doc: &BookDocument) -> AppResult<()> {
        self.index_handle()
            .add_or_replace(std::slice::from_ref(doc), Some(PRIMARY_KEY))
            .await
            .map_err(|e| degraded("Failed to index book", e))?;
        Ok(())
    }

    async fn delete(&self, id: i32) -> AppResult<()> {
        self.index_handle()
            .delete_document(id)
            .await
            .map_err(|e| degraded("Failed to remove indexed book", e))?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> AppResult<SearchPage> {
        let index = self.index_handle();
        let fields: Vec<&str> = query.fields.iter().map(String::as_str).collect();
        let strategy = match query.mode {
            MatchMode::All => MatchingStrategies::ALL,
            MatchMode::Any => MatchingStrategies::LAST,
        };

        let results = index
            .search()
            .with_query(&query.text)
            .with_offset(query.from)
            .with_limit(query.size)
            .with_attributes_to_search_on(&fields)
            .with_attributes_to_highlight(Selectors::All)
            .with_highlight_pre_tag(HIGHLIGHT_PRE_TAG)
            .with_highlight_post_tag(HIGHLIGHT_POST_TAG)
            .with_matching_strategy(strategy)
            .execute::<BookDocument>()
            .await
            .map_err(|e| degraded("Search request failed", e))?;

        let total = results
            .total_hits
            .or(results.estimated_total_hits)
            .unwrap_or(results.hits.len());

        let hits = results
            .hits
            .into_iter()
            .map(|hit| {
                let highlights: BTreeMap<String, String> = hit
                    .formatted_result
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(field, _)| fields.contains(&field.as_str()))
                    .filter_map(|(field, value)| match value {
                        Value::String(text) if text.contains(HIGHLIGHT_PRE_TAG) => Some((field, text)),
                        _ => None,
                    })
                    .collect();
                SearchHit {
                    book: hit.result,
                    highlights,
                }
            })
            .collect();

        Ok(SearchPage {
            hits,
            total,
            from: query.from,
            size: query.size,
        })
    }

    async fn bulk_reindex(&self, docs: &[BookDocument]) -> AppResult<usize> {
        let index = self.index_handle();

        let task = index
            .delete_all_documents()
            .await
            .map_err(|e| degraded("Failed to clear search index", e))?;
        self.wait(task, "Failed to clear search index").await?;

        if !docs.is_empty() {
            let task = index
                .add_or_replace(docs, Some(PRIMARY_KEY))
                .await
                .map_err(|e| degraded("Failed to bulk index books", e))?;
            self.wait(task, "Failed to bulk index books").await?;
        }

        Ok(docs.len())
    }

    async fn ping(&self) -> AppResult<()> {
        self.client
            .health()
            .await
            .map_err(|e| degraded("Search engine unreachable", e))?;
        Ok(())
    }
}
