//! Repository layer: the relational store contract and its implementations.
//!
//! [`Store`] is everything the catalog coordinator and the loan state machine
//! need from the source of truth. Mutations of loans and of `Book.status`
//! only happen inside a [`StoreTransaction`], whose `*_for_update` reads take
//! an exclusive row lock held until commit or rollback. That lock is the only
//! serialization point between concurrent borrow/return requests, including
//! across server replicas.

pub mod books;
pub mod loans;
pub mod memory;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{Book, BookFilter, BookLoan, BookStatus, CreateBook, LoanWithBook, UpdateBook, User},
};

pub use memory::MemoryStore;

/// Relational source of truth for books, users and loans
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction for a loan state change
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>>;

    /// Look a book up by numeric id or by ISBN. An id match wins over an
    /// ISBN match.
    async fn find_book(&self, id_or_isbn: &str) -> AppResult<Option<Book>>;

    /// Books matching `filter`, ordered by id
    async fn list_books(&self, filter: &BookFilter) -> AppResult<Vec<Book>>;

    /// Insert a new, available book
    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book>;

    /// Update bibliographic fields; `None` if the book does not exist
    async fn update_book(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>>;

    /// Delete a book no loan has ever referenced. Returns the deleted row,
    /// `None` if absent, `InvalidState` if loans reference it.
    async fn delete_book(&self, id: i32) -> AppResult<Option<Book>>;

    /// Open loans of a user, oldest first
    async fn open_loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>>;

    /// Every loan of a user, newest first
    async fn loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>>;

    async fn find_user(&self, id: i32) -> AppResult<Option<User>>;

    /// Cheap liveness check
    async fn ping(&self) -> AppResult<()>;
}

/// A single atomic unit of work against the store.
///
/// Dropping a transaction without calling [`StoreTransaction::commit`]
/// discards its writes and releases its locks.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a book and hold an exclusive lock on its row
    async fn book_for_update(&mut self, book_id: i32) -> AppResult<Option<Book>>;

    /// Read a loan and hold an exclusive lock on its row
    async fn loan_for_update(&mut self, loan_id: i32) -> AppResult<Option<BookLoan>>;

    /// Whether `user_id` holds an open loan on `book_id`
    async fn open_loan_exists(&mut self, user_id: i32, book_id: i32) -> AppResult<bool>;

    /// Plain read of a book as seen by this transaction
    async fn book(&mut self, book_id: i32) -> AppResult<Option<Book>>;

    async fn set_book_status(&mut self, book_id: i32, status: BookStatus) -> AppResult<()>;

    async fn insert_loan(
        &mut self,
        user_id: i32,
        book_id: i32,
        loan_date: DateTime<Utc>,
    ) -> AppResult<BookLoan>;

    /// Set `return_date` on an open loan. `InvalidState` if already closed.
    async fn close_loan(&mut self, loan_id: i32, return_date: DateTime<Utc>) -> AppResult<BookLoan>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct Repository {
    pub pool: Pool<Postgres>,
    pub books: books::BooksRepository,
    pub loans: loans::LoansRepository,
    pub users: users::UsersRepository,
}

impl Repository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: books::BooksRepository::new(pool.clone()),
            loans: loans::LoansRepository::new(pool.clone()),
            users: users::UsersRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl Store for Repository {
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(self.loans.begin().await?))
    }

    async fn find_book(&self, id_or_isbn: &str) -> AppResult<Option<Book>> {
        self.books.get_by_id_or_isbn(id_or_isbn).await
    }

    async fn list_books(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        self.books.list(filter).await
    }

    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book> {
        self.books.create(book).await
    }

    async fn update_book(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
        self.books.update(id, changes).await
    }

    async fn delete_book(&self, id: i32) -> AppResult<Option<Book>> {
        self.books.delete(id).await
    }

    async fn open_loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        self.loans.get_open_for_user(user_id).await
    }

    async fn loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        self.loans.get_history_for_user(user_id).await
    }

    async fn find_user(&self, id: i32) -> AppResult<Option<User>> {
        self.users.get_by_id(id).await
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
