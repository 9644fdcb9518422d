//! Catalog service: read-through cache over the store, search index upkeep.
//!
//! The store is authoritative. Cache entries and index documents are derived
//! projections; every call to either is bounded by a short timeout and a
//! failure is logged, never returned to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use validator::Validate;

use crate::{
    config::{CacheConfig, SearchConfig},
    error::{AppError, AppResult},
    models::{Book, BookFilter, BookStatus, CreateBook, UpdateBook},
    repository::Store,
};

use super::{
    cache::Cache,
    search::{BookDocument, MatchMode, MemorySearchIndex, SearchIndex, SearchPage, SearchQuery},
};

/// Cache key of the full book listing
pub const ALL_BOOKS_KEY: &str = "all_books";

pub fn book_key(id_or_isbn: &str) -> String {
    format!("book:{}", id_or_isbn)
}

/// Every cache key that may hold a projection of `book`
pub fn book_keys(book: &Book) -> Vec<String> {
    vec![
        book_key(&book.id.to_string()),
        book_key(&book.isbn),
        ALL_BOOKS_KEY.to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReindexSummary {
    pub indexed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub store: DependencyStatus,
    pub cache: DependencyStatus,
    pub search: DependencyStatus,
}

impl HealthReport {
    /// Only the store is required to serve requests
    pub fn is_ready(&self) -> bool {
        self.store == DependencyStatus::Up
    }
}

/// Run a cache or index call, turning errors and timeouts into `None`
async fn best_effort<T, F>(timeout: Duration, what: &str, fut: F) -> Option<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("{} failed: {}", what, e);
            None
        }
        Err(_) => {
            tracing::warn!("{} timed out after {:?}", what, timeout);
            None
        }
    }
}

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    search: Arc<dyn SearchIndex>,
    cache_ttl: Duration,
    cache_timeout: Duration,
    search_timeout: Duration,
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        search: Arc<dyn SearchIndex>,
        cache_config: &CacheConfig,
        search_config: &SearchConfig,
    ) -> Self {
        Self {
            store,
            cache,
            search,
            cache_ttl: cache_config.ttl(),
            cache_timeout: cache_config.timeout(),
            search_timeout: search_config.timeout(),
        }
    }

    // =========================================================================
    // CACHE
    // =========================================================================

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = best_effort(self.cache_timeout, "Cache read", self.cache.get(key))
            .await
            .flatten()?;

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!("Cache hit for {}", key);
                Some(value)
            }
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to encode cache entry {}: {}", key, e);
                return;
            }
        };
        best_effort(
            self.cache_timeout,
            "Cache write",
            self.cache.set(key, &raw, self.cache_ttl),
        )
        .await;
    }

    /// Drop cache entries. Missing keys and cache failures are ignored.
    pub async fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        tracing::debug!("Invalidating cache keys {:?}", keys);
        best_effort(self.cache_timeout, "Cache invalidation", self.cache.delete(keys)).await;
    }

    async fn index_book(&self, book: &Book) {
        let doc = BookDocument::from(book);
        best_effort(self.search_timeout, "Search indexing", self.search.index(&doc)).await;
    }

    // =========================================================================
    // READ
    // =========================================================================

    /// Get a book by numeric id or by ISBN, through the cache.
    ///
    /// An entry is only kept under a key that names the book exactly, so
    /// the keys in `book_keys` are the only ones a loan has to invalidate.
    pub async fn get_book(&self, id_or_isbn: &str) -> AppResult<Option<Book>> {
        let key = book_key(id_or_isbn);
        let hit = self
            .cached::<Book>(&key)
            .await
            .filter(|book| book.is_named_by(id_or_isbn));
        if let Some(book) = hit {
            return Ok(Some(book));
        }

        tracing::debug!("Cache miss for {}", key);
        let book = self.store.find_book(id_or_isbn).await?;
        match book {
            Some(ref found) if found.is_named_by(id_or_isbn) => self.populate(&key, found).await,
            Some(ref found) => tracing::debug!("Not caching book {} under {}", found.id, key),
            None => {}
        }
        Ok(book)
    }

    /// All books, through the cache
    pub async fn list_books(&self) -> AppResult<Vec<Book>> {
        if let Some(books) = self.cached::<Vec<Book>>(ALL_BOOKS_KEY).await {
            return Ok(books);
        }

        tracing::debug!("Cache miss for {}", ALL_BOOKS_KEY);
        let books = self.store.list_books(&BookFilter::All).await?;
        self.populate(ALL_BOOKS_KEY, &books).await;
        Ok(books)
    }

    pub async fn books_by_status(&self, status: BookStatus) -> AppResult<Vec<Book>> {
        self.store.list_books(&BookFilter::Status(status)).await
    }

    pub async fn books_by_author(&self, author: &str) -> AppResult<Vec<Book>> {
        self.store
            .list_books(&BookFilter::Author(author.to_string()))
            .await
    }

    pub async fn books_by_price_range(&self, min: Decimal, max: Decimal) -> AppResult<Vec<Book>> {
        if min > max {
            return Err(AppError::Validation(format!(
                "Minimum price {} is greater than maximum price {}",
                min, max
            )));
        }
        self.store
            .list_books(&BookFilter::PriceRange { min, max })
            .await
    }

    // =========================================================================
    // WRITE
    // =========================================================================

    pub async fn create_book(&self, book: CreateBook) -> AppResult<Book> {
        book.validate()?;

        let created = self.store.insert_book(&book).await?;
        tracing::info!("Created book {} (isbn {})", created.id, created.isbn);

        self.invalidate(&book_keys(&created)).await;
        self.index_book(&created).await;
        Ok(created)
    }

    /// Partial update of bibliographic fields
    pub async fn update_book(&self, id: i32, changes: UpdateBook) -> AppResult<Book> {
        changes.check()?;
        if changes.is_empty() {
            return Err(AppError::Validation("No fields to update".to_string()));
        }

        let updated = self
            .store
            .update_book(id, &changes)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;

        self.invalidate(&book_keys(&updated)).await;
        self.index_book(&updated).await;
        Ok(updated)
    }

    /// Delete a book that has never been lent
    pub async fn delete_book(&self, id: i32) -> AppResult<()> {
        let deleted = self
            .store
            .delete_book(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;
        tracing::info!("Deleted book {} (isbn {})", deleted.id, deleted.isbn);

        self.invalidate(&book_keys(&deleted)).await;
        best_effort(self.search_timeout, "Search removal", self.search.delete(id)).await;
        Ok(())
    }

    /// Refresh derived projections after a committed borrow or return.
    /// `book` carries the committed status.
    pub async fn loan_committed(&self, book: &Book) {
        self.invalidate(&book_keys(book)).await;
        // Whole document: a partial write would leave a stub if indexing
        // this book failed earlier
        self.index_book(book).await;
    }

    // =========================================================================
    // SEARCH
    // =========================================================================

    /// Full-text search. When the index is unavailable the same matching
    /// runs over a store scan so the endpoint keeps answering.
    pub async fn search_books(&self, query: SearchQuery) -> AppResult<SearchPage> {
        let query = query.validated()?;

        if let Some(page) =
            best_effort(self.search_timeout, "Search query", self.search.search(&query)).await
        {
            return Ok(page);
        }

        tracing::info!("Serving search for {:?} from the store", query.text);
        let books = self.store.list_books(&BookFilter::All).await?;
        let fallback = MemorySearchIndex::from_documents(books.iter().map(BookDocument::from));
        fallback.search(&query).await
    }

    /// Books sharing title or author terms with book `id`
    pub async fn similar_books(&self, id: i32) -> AppResult<SearchPage> {
        let book = self
            .get_book(&id.to_string())
            .await?
            .filter(|book| book.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;

        let query = SearchQuery::new(format!("{} {}", book.title, book.author))
            .with_fields(["title", "author"])
            .with_page(0, SearchQuery::DEFAULT_SIZE + 1)
            .with_mode(MatchMode::Any);

        let mut page = self.search_books(query).await?;
        let before = page.hits.len();
        page.hits.retain(|hit| hit.book.id != id);
        page.total = page.total.saturating_sub(before - page.hits.len());
        page.hits.truncate(SearchQuery::DEFAULT_SIZE);
        page.size = SearchQuery::DEFAULT_SIZE;
        Ok(page)
    }

    /// Rebuild the index from the store. Unlike other index calls, failures
    /// are returned since rebuilding is the whole point of the request.
    pub async fn reindex_all(&self) -> AppResult<ReindexSummary> {
        let books = self.store.list_books(&BookFilter::All).await?;
        let docs: Vec<BookDocument> = books.iter().map(BookDocument::from).collect();

        self.search.ensure_index().await?;
        let indexed = self.search.bulk_reindex(&docs).await?;
        tracing::info!("Reindexed {} books", indexed);

        Ok(ReindexSummary { indexed })
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    pub async fn health(&self) -> HealthReport {
        let store = match self.store.ping().await {
            Ok(()) => DependencyStatus::Up,
            Err(e) => {
                tracing::error!("Store health check failed: {}", e);
                DependencyStatus::Down
            }
        };
        let cache = match best_effort(self.cache_timeout, "Cache ping", self.cache.ping()).await {
            Some(()) => DependencyStatus::Up,
            None => DependencyStatus::Degraded,
        };
        let search = match best_effort(self.search_timeout, "Search ping", self.search.ping()).await
        {
            Some(()) => DependencyStatus::Up,
            None => DependencyStatus::Degraded,
        };

        HealthReport {
            store,
            cache,
            search,
        }
    }
}
