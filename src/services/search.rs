//! Full-text search contract and an in-process index.
//!
//! The index is a derived projection of the `books` table. It may lag or miss
//! documents and is rebuilt from the store by a reindex.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    error::{AppError, AppResult},
    models::{Book, BookStatus},
};

/// Fields a query may be matched against
pub const SEARCHABLE_FIELDS: [&str; 4] = ["title", "author", "isbn", "description"];

pub const HIGHLIGHT_PRE_TAG: &str = "<em>";
pub const HIGHLIGHT_POST_TAG: &str = "</em>";

/// Indexed projection of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDocument {
    pub id: i32,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub description: String,
    pub price: Decimal,
    pub publish_date: NaiveDate,
    pub status: BookStatus,
}

impl From<&Book> for BookDocument {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id,
            isbn: book.isbn.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            description: book.description.clone(),
            price: book.price,
            publish_date: book.publish_date,
            status: book.status,
        }
    }
}

impl BookDocument {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "title" => Some(&self.title),
            "author" => Some(&self.author),
            "isbn" => Some(&self.isbn),
            "description" => Some(&self.description),
            _ => None,
        }
    }
}

/// How query terms combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Every term must match (AND)
    #[default]
    All,
    /// At least one term must match
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    /// Restrict matching to these fields; empty means all searchable fields
    pub fields: Vec<String>,
    pub from: usize,
    pub size: usize,
    pub mode: MatchMode,
}

impl SearchQuery {
    pub const DEFAULT_SIZE: usize = 10;
    pub const MAX_SIZE: usize = 100;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fields: Vec::new(),
            from: 0,
            size: Self::DEFAULT_SIZE,
            mode: MatchMode::All,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_page(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reject unknown fields, default an empty field list to every
    /// searchable field and clamp the page size
    pub fn validated(mut self) -> AppResult<Self> {
        for field in &self.fields {
            if !SEARCHABLE_FIELDS.contains(&field.as_str()) {
                return Err(AppError::Validation(format!(
                    "Field '{}' is not searchable (expected one of {})",
                    field,
                    SEARCHABLE_FIELDS.join(", ")
                )));
            }
        }
        if self.fields.is_empty() {
            self.fields = SEARCHABLE_FIELDS.iter().map(|f| f.to_string()).collect();
        }
        if self.size == 0 {
            self.size = Self::DEFAULT_SIZE;
        }
        self.size = self.size.min(Self::MAX_SIZE);
        Ok(self)
    }
}

/// One ranked result; `highlights` maps a field to its text with matches
/// wrapped in `<em>` tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub book: BookDocument,
    pub highlights: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Total matches, possibly estimated by the index
    pub total: usize,
    pub from: usize,
    pub size: usize,
}

/// Best-effort document index over books
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index and its settings when absent
    async fn ensure_index(&self) -> AppResult<()>;

    /// Insert or replace a document
    async fn index(&self, doc: &BookDocument) -> AppResult<()>;

    async fn delete(&self, id: i32) -> AppResult<()>;

    async fn search(&self, query: &SearchQuery) -> AppResult<SearchPage>;

    /// Replace the whole index content with `docs`. Returns the number of
    /// documents indexed.
    async fn bulk_reindex(&self, docs: &[BookDocument]) -> AppResult<usize>;

    async fn ping(&self) -> AppResult<()>;
}

/// In-process index with the same matching rules as the production engine:
/// typo-tolerant term matching, AND or any-term combination, highlighting
#[derive(Clone, Default)]
pub struct MemorySearchIndex {
    docs: Arc<RwLock<BTreeMap<i32, BookDocument>>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(docs: impl IntoIterator<Item = BookDocument>) -> Self {
        let docs = docs.into_iter().map(|d| (d.id, d)).collect();
        Self {
            docs: Arc::new(RwLock::new(docs)),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    pub async fn document(&self, id: i32) -> Option<BookDocument> {
        self.docs.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_index(&self) -> AppResult<()> {
        Ok(())
    }

    async fn index(&self, doc: &BookDocument) -> AppResult<()> {
        self.docs.write().await.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn delete(&self, id: i32) -> AppResult<()> {
        self.docs.write().await.remove(&id);
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> AppResult<SearchPage> {
        let docs = self.docs.read().await;
        let terms = tokenize(&query.text);

        let mut ranked: Vec<(Score, &BookDocument)> = docs
            .values()
            .filter_map(|doc| score(doc, &terms, &query.fields, query.mode).map(|s| (s, doc)))
            .collect();
        ranked.sort_by(|(a, da), (b, db)| {
            b.matched
                .cmp(&a.matched)
                .then(b.exact.cmp(&a.exact))
                .then(da.id.cmp(&db.id))
        });

        let total = ranked.len();
        let hits = ranked
            .into_iter()
            .skip(query.from)
            .take(query.size)
            .map(|(_, doc)| SearchHit {
                highlights: highlight(doc, &terms, &query.fields),
                book: doc.clone(),
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
        let mut indexed = self.docs.write().await;
        *indexed = docs.iter().map(|d| (d.id, d.clone())).collect();
        Ok(indexed.len())
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Score {
    matched: usize,
    exact: usize,
}

/// Lowercased alphanumeric runs
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Typos allowed for a term: none under 5 characters, one under 9, else two
fn typo_budget(term: &str) -> usize {
    match term.chars().count() {
        0..=4 => 0,
        5..=8 => 1,
        _ => 2,
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn term_matches(term: &str, token: &str) -> bool {
    token == term || token.starts_with(term) || levenshtein(term, token) <= typo_budget(term)
}

fn score(doc: &BookDocument, terms: &[String], fields: &[String], mode: MatchMode) -> Option<Score> {
    if terms.is_empty() {
        return Some(Score { matched: 0, exact: 0 });
    }

    let tokens: Vec<String> = fields
        .iter()
        .filter_map(|f| doc.field(f))
        .flat_map(tokenize)
        .collect();

    let mut result = Score { matched: 0, exact: 0 };
    for term in terms {
        if tokens.iter().any(|t| t == term) {
            result.matched += 1;
            result.exact += 1;
        } else if tokens.iter().any(|t| term_matches(term, t)) {
            result.matched += 1;
        }
    }

    let accepted = match mode {
        MatchMode::All => result.matched == terms.len(),
        MatchMode::Any => result.matched > 0,
    };
    accepted.then_some(result)
}

fn highlight(doc: &BookDocument, terms: &[String], fields: &[String]) -> BTreeMap<String, String> {
    let mut highlights = BTreeMap::new();
    if terms.is_empty() {
        return highlights;
    }

    for field in fields {
        let Some(text) = doc.field(field) else {
            continue;
        };

        let mut out = String::with_capacity(text.len());
        let mut word = String::new();
        let mut any = false;

        let mut flush = |word: &mut String, out: &mut String| {
            if word.is_empty() {
                return;
            }
            let lowered = word.to_lowercase();
            if terms.iter().any(|term| term_matches(term, &lowered)) {
                out.push_str(HIGHLIGHT_PRE_TAG);
                out.push_str(word);
                out.push_str(HIGHLIGHT_POST_TAG);
                any = true;
            } else {
                out.push_str(word);
            }
            word.clear();
        };

        for c in text.chars() {
            if c.is_alphanumeric() {
                word.push(c);
            } else {
                flush(&mut word, &mut out);
                out.push(c);
            }
        }
        flush(&mut word, &mut out);

        if any {
            highlights.insert(field.clone(), out);
        }
    }

    highlights
}
