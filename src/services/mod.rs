//! Business logic services

pub mod cache;
pub mod catalog;
pub mod loans;
pub mod meilisearch;
pub mod redis;
pub mod search;

use std::sync::Arc;

use crate::{
    config::{CacheConfig, SearchConfig},
    repository::Store,
};

use self::{cache::Cache, search::SearchIndex};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub loans: loans::LoansService,
}

impl Services {
    /// Wire the services over the given store, cache and search index
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        search: Arc<dyn SearchIndex>,
        cache_config: &CacheConfig,
        search_config: &SearchConfig,
    ) -> Self {
        let catalog =
            catalog::CatalogService::new(store.clone(), cache, search, cache_config, search_config);
        let loans = loans::LoansService::new(store, catalog.clone());

        Self { catalog, loans }
    }
}
