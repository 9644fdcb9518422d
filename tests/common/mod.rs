//! Shared fixtures: the full service stack over the in-memory adapters

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;

use bookloan_server::{
    config::AppConfig,
    models::{Book, BookLoan, BookStatus, CreateBook, Role, User, UserClaims},
    repository::{MemoryStore, Store},
    services::{cache::MemoryCache, search::MemorySearchIndex, Services},
    AppState,
};

pub const JWT_SECRET: &str = "test-secret";

pub struct TestApp {
    pub store: MemoryStore,
    pub cache: MemoryCache,
    pub search: MemorySearchIndex,
    pub services: Services,
}

impl TestApp {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let cache = MemoryCache::new();
        let search = MemorySearchIndex::new();
        let config = AppConfig::default();
        let services = Services::new(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            Arc::new(search.clone()),
            &config.cache,
            &config.search,
        );

        Self {
            store,
            cache,
            search,
            services,
        }
    }

    pub async fn reader(&self, username: &str) -> User {
        self.store.add_user(username, Role::Reader).await
    }

    pub async fn admin(&self, username: &str) -> User {
        self.store.add_user(username, Role::Admin).await
    }

    /// Create a book through the catalog so it is indexed too
    pub async fn book(&self, isbn: &str, title: &str, author: &str) -> Book {
        self.services
            .catalog
            .create_book(new_book(isbn, title, author))
            .await
            .expect("Failed to create book")
    }

    pub fn state(&self) -> AppState {
        let mut config = AppConfig::default();
        config.auth.jwt_secret = JWT_SECRET.to_string();

        AppState {
            config: Arc::new(config),
            services: Arc::new(self.services.clone()),
        }
    }

    /// Status stored for `isbn`, bypassing the cache
    pub async fn stored_status(&self, isbn: &str) -> BookStatus {
        self.store
            .find_book(isbn)
            .await
            .expect("Store read failed")
            .expect("Book missing")
            .status
    }

    /// Every book is `borrowed` exactly when an open loan references it,
    /// and no book has two open loans
    pub async fn assert_status_matches_loans(&self) {
        let loans: Vec<BookLoan> = self.store.all_loans().await;
        let books = self
            .store
            .list_books(&bookloan_server::models::BookFilter::All)
            .await
            .expect("Store read failed");

        for book in books {
            let open = loans
                .iter()
                .filter(|loan| loan.book_id == book.id && loan.is_open())
                .count();
            assert!(open <= 1, "book {} has {} open loans", book.id, open);
            assert_eq!(
                book.status == BookStatus::Borrowed,
                open == 1,
                "book {} is {} with {} open loans",
                book.id,
                book.status,
                open
            );
        }
    }
}

pub fn new_book(isbn: &str, title: &str, author: &str) -> CreateBook {
    CreateBook {
        isbn: isbn.to_string(),
        title: title.to_string(),
        author: author.to_string(),
        description: format!("{} by {}", title, author),
        price: Decimal::new(5999, 2),
        publish_date: NaiveDate::from_ymd_opt(2020, 1, 15).expect("valid date"),
    }
}

pub fn token_for(user: &User) -> String {
    let now = Utc::now();
    UserClaims {
        sub: user.username.clone(),
        user_id: user.id,
        role: user.role,
        exp: (now + Duration::hours(1)).timestamp(),
        iat: now.timestamp(),
    }
    .create_token(JWT_SECRET)
    .expect("Failed to sign token")
}
