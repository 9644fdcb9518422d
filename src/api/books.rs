//! Book (catalog) endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    models::{Book, BookLoan, BookStatus, BorrowRequest, CreateBook, UpdateBook},
    services::{
        catalog::ReindexSummary,
        search::{SearchPage, SearchQuery},
    },
    AppState,
};

use super::AuthenticatedUser;

/// Optional filters for the book listing. At most one kind of filter may be
/// given (the two price bounds count as one). Without any, the cached full
/// listing is returned.
#[derive(Debug, Default, Deserialize)]
pub struct BookListQuery {
    pub status: Option<String>,
    pub author: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

impl BookListQuery {
    fn filter_count(&self) -> usize {
        [
            self.status.is_some(),
            self.author.is_some(),
            self.min_price.is_some() || self.max_price.is_some(),
        ]
        .into_iter()
        .filter(|given| *given)
        .count()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BookSearchParams {
    #[serde(default)]
    pub q: String,
    /// Comma-separated list of fields to search in
    pub fields: Option<String>,
    pub from: Option<usize>,
    pub size: Option<usize>,
}

impl From<BookSearchParams> for SearchQuery {
    fn from(params: BookSearchParams) -> Self {
        let fields: Vec<String> = params
            .fields
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        SearchQuery::new(params.q)
            .with_fields(fields)
            .with_page(
                params.from.unwrap_or(0),
                params.size.unwrap_or(SearchQuery::DEFAULT_SIZE),
            )
    }
}

/// List books, optionally filtered by status, author or price range
pub async fn list_books(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Query(query): Query<BookListQuery>,
) -> AppResult<Json<Vec<Book>>> {
    let catalog = &state.services.catalog;

    if query.filter_count() > 1 {
        return Err(AppError::BadRequest(
            "Filter by one of status, author or price range".to_string(),
        ));
    }

    let books = if let Some(status) = query.status {
        let status: BookStatus = status.parse()?;
        catalog.books_by_status(status).await?
    } else if let Some(author) = query.author {
        catalog.books_by_author(&author).await?
    } else if query.min_price.is_some() || query.max_price.is_some() {
        catalog
            .books_by_price_range(
                query.min_price.unwrap_or(Decimal::ZERO),
                query.max_price.unwrap_or(Decimal::MAX),
            )
            .await?
    } else {
        catalog.list_books().await?
    };

    Ok(Json(books))
}

/// Get a book by ID or ISBN
pub async fn get_book(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(id_or_isbn): Path<String>,
) -> AppResult<Json<Book>> {
    state
        .services
        .catalog
        .get_book(&id_or_isbn)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Book {} not found", id_or_isbn)))
}

/// Create a new book
pub async fn create_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(book): Json<CreateBook>,
) -> AppResult<(StatusCode, Json<Book>)> {
    claims.require_admin()?;

    let created = state.services.catalog.create_book(book).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Update the bibliographic fields of a book
pub async fn update_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i32>,
    Json(changes): Json<UpdateBook>,
) -> AppResult<Json<Book>> {
    claims.require_admin()?;

    let updated = state.services.catalog.update_book(id, changes).await?;
    Ok(Json(updated))
}

/// Delete a book that was never lent
pub async fn delete_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    claims.require_admin()?;

    state.services.catalog.delete_book(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Full-text search with highlighting
pub async fn search_books(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Query(params): Query<BookSearchParams>,
) -> AppResult<Json<SearchPage>> {
    let page = state.services.catalog.search_books(params.into()).await?;
    Ok(Json(page))
}

pub async fn similar_books(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(id): Path<i32>,
) -> AppResult<Json<SearchPage>> {
    let page = state.services.catalog.similar_books(id).await?;
    Ok(Json(page))
}

/// Rebuild the search index from the database
pub async fn reindex_books(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<ReindexSummary>> {
    claims.require_admin()?;

    let summary = state.services.catalog.reindex_all().await?;
    Ok(Json(summary))
}

/// Borrow a book for the authenticated user
pub async fn borrow_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(book_id): Path<i32>,
) -> AppResult<(StatusCode, Json<BookLoan>)> {
    let loan = state
        .services
        .loans
        .borrow(BorrowRequest {
            user_id: claims.user_id,
            book_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(loan)))
}
