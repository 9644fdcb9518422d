//! Loan service: the borrow/return state machine.
//!
//! A book is `borrowed` exactly when an open loan references it. Both
//! transitions run in one store transaction that starts by locking the row it
//! changes, so two concurrent borrows of the same book are serialized and the
//! second one sees the first one's committed status.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    error::{AppError, AppResult},
    models::{Book, BookLoan, BookStatus, BorrowRequest, LoanWithBook, ReturnRequest},
    repository::{Store, StoreTransaction},
};

use super::catalog::CatalogService;

type Transaction = Box<dyn StoreTransaction>;

#[derive(Clone)]
pub struct LoansService {
    store: Arc<dyn Store>,
    catalog: CatalogService,
}

impl LoansService {
    pub fn new(store: Arc<dyn Store>, catalog: CatalogService) -> Self {
        Self { store, catalog }
    }

    /// Lend a book to a user. Returns the created loan.
    pub async fn borrow(&self, request: BorrowRequest) -> AppResult<BookLoan> {
        if self.store.find_user(request.user_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "User with id {} not found",
                request.user_id
            )));
        }

        let mut tx = self.store.begin().await?;
        let (loan, book) = match Self::borrow_in(&mut tx, request).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(Self::abort(tx, e).await),
        };
        tx.commit().await?;

        tracing::info!(
            "Loan {} created: book {} lent to user {}",
            loan.id,
            loan.book_id,
            loan.user_id
        );
        self.catalog.loan_committed(&book).await;
        Ok(loan)
    }

    async fn borrow_in(tx: &mut Transaction, request: BorrowRequest) -> AppResult<(BookLoan, Book)> {
        let BorrowRequest { user_id, book_id } = request;

        let book = tx
            .book_for_update(book_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", book_id)))?;

        if tx.open_loan_exists(user_id, book_id).await? {
            return Err(AppError::InvalidState(format!(
                "Book {} is already borrowed by this user and not returned",
                book_id
            )));
        }

        if !book.is_available() {
            return Err(AppError::InvalidState(format!(
                "Book {} is not available (status: {})",
                book_id, book.status
            )));
        }

        tx.set_book_status(book_id, BookStatus::Borrowed).await?;
        let loan = tx.insert_loan(user_id, book_id, Utc::now()).await?;

        // Re-read inside the transaction: the write must be visible before commit
        match tx.book(book_id).await? {
            Some(book) if book.status == BookStatus::Borrowed => Ok((loan, book)),
            other => Err(AppError::ConsistencyFault(format!(
                "Book {} reads back as {} after borrow",
                book_id,
                other
                    .map(|b| b.status.to_string())
                    .unwrap_or_else(|| "missing".to_string())
            ))),
        }
    }

    /// Close a loan and make its book available again
    pub async fn return_loan(&self, request: ReturnRequest) -> AppResult<BookLoan> {
        let mut tx = self.store.begin().await?;
        let (loan, book) = match Self::return_in(&mut tx, request).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(Self::abort(tx, e).await),
        };
        tx.commit().await?;

        tracing::info!(
            "Loan {} returned: book {} is available",
            loan.id,
            loan.book_id
        );
        self.catalog.loan_committed(&book).await;
        Ok(loan)
    }

    async fn return_in(tx: &mut Transaction, request: ReturnRequest) -> AppResult<(BookLoan, Book)> {
        let loan_id = request.loan_id;

        let loan = tx
            .loan_for_update(loan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", loan_id)))?;

        if let Some(user_id) = request.on_behalf_of {
            if loan.user_id != user_id {
                return Err(AppError::Authorization(format!(
                    "Loan {} belongs to another user",
                    loan_id
                )));
            }
        }

        if !loan.is_open() {
            return Err(AppError::InvalidState(format!(
                "Loan {} has already been returned",
                loan_id
            )));
        }

        let mut book = tx.book_for_update(loan.book_id).await?.ok_or_else(|| {
            AppError::ConsistencyFault(format!(
                "Loan {} references missing book {}",
                loan_id, loan.book_id
            ))
        })?;

        let closed = tx.close_loan(loan_id, Utc::now()).await?;
        tx.set_book_status(book.id, BookStatus::Available).await?;
        book.status = BookStatus::Available;

        Ok((closed, book))
    }

    /// Roll back and hand the original error back
    async fn abort(tx: Transaction, error: AppError) -> AppError {
        if let AppError::ConsistencyFault(ref reason) = error {
            tracing::error!("Rolling back loan transaction: {}", reason);
        }
        if let Err(e) = tx.rollback().await {
            tracing::warn!("Rollback failed, transaction dropped instead: {}", e);
        }
        error
    }

    /// Open loans of a user, oldest first
    pub async fn open_loans(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        self.store.open_loans_for_user(user_id).await
    }

    /// Every loan of a user, newest first
    pub async fn loan_history(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        self.store.loans_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CacheConfig, SearchConfig},
        models::{BookFilter, CreateBook, Role, UpdateBook, User},
        repository::MemoryStore,
        services::{
            cache::{Cache, MemoryCache, MockCache},
            search::{MemorySearchIndex, SearchIndex},
        },
    };
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate};
    use rust_decimal::Decimal;

    fn service_with(store: Arc<dyn Store>, cache: impl Cache + 'static) -> LoansService {
        let search: Arc<dyn SearchIndex> = Arc::new(MemorySearchIndex::new());
        let catalog = CatalogService::new(
            store.clone(),
            Arc::new(cache),
            search,
            &CacheConfig::default(),
            &SearchConfig::default(),
        );
        LoansService::new(store, catalog)
    }

    async fn seed(store: &MemoryStore) -> (User, Book) {
        let user = store.add_user("reader", Role::Reader).await;
        let book = store
            .insert_book(&CreateBook {
                isbn: "123".to_string(),
                title: "The Pragmatic Programmer".to_string(),
                author: "Andrew Hunt".to_string(),
                description: String::new(),
                price: Decimal::new(4200, 2),
                publish_date: NaiveDate::from_ymd_opt(1999, 10, 20).unwrap(),
            })
            .await
            .unwrap();
        (user, book)
    }

    /// Store whose transactions report the pre-borrow status on re-read
    struct StaleReadStore(MemoryStore);

    struct StaleReadTransaction(Box<dyn StoreTransaction>);

    #[async_trait]
    impl StoreTransaction for StaleReadTransaction {
        async fn book_for_update(&mut self, book_id: i32) -> AppResult<Option<Book>> {
            self.0.book_for_update(book_id).await
        }
        async fn loan_for_update(&mut self, loan_id: i32) -> AppResult<Option<BookLoan>> {
            self.0.loan_for_update(loan_id).await
        }
        async fn open_loan_exists(&mut self, user_id: i32, book_id: i32) -> AppResult<bool> {
            self.0.open_loan_exists(user_id, book_id).await
        }
        async fn book(&mut self, book_id: i32) -> AppResult<Option<Book>> {
            Ok(self.0.book(book_id).await?.map(|mut book| {
                book.status = BookStatus::Available;
                book
            }))
        }
        async fn set_book_status(&mut self, book_id: i32, status: BookStatus) -> AppResult<()> {
            self.0.set_book_status(book_id, status).await
        }
        async fn insert_loan(
            &mut self,
            user_id: i32,
            book_id: i32,
            loan_date: DateTime<Utc>,
        ) -> AppResult<BookLoan> {
            self.0.insert_loan(user_id, book_id, loan_date).await
        }
        async fn close_loan(&mut self, loan_id: i32, return_date: DateTime<Utc>) -> AppResult<BookLoan> {
            self.0.close_loan(loan_id, return_date).await
        }
        async fn commit(self: Box<Self>) -> AppResult<()> {
            self.0.commit().await
        }
        async fn rollback(self: Box<Self>) -> AppResult<()> {
            self.0.rollback().await
        }
    }

    #[async_trait]
    impl Store for StaleReadStore {
        async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>> {
            Ok(Box::new(StaleReadTransaction(self.0.begin().await?)))
        }
        async fn find_book(&self, id_or_isbn: &str) -> AppResult<Option<Book>> {
            self.0.find_book(id_or_isbn).await
        }
        async fn list_books(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
            self.0.list_books(filter).await
        }
        async fn insert_book(&self, book: &CreateBook) -> AppResult<Book> {
            self.0.insert_book(book).await
        }
        async fn update_book(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
            self.0.update_book(id, changes).await
        }
        async fn delete_book(&self, id: i32) -> AppResult<Option<Book>> {
            self.0.delete_book(id).await
        }
        async fn open_loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
            self.0.open_loans_for_user(user_id).await
        }
        async fn loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
            self.0.loans_for_user(user_id).await
        }
        async fn find_user(&self, id: i32) -> AppResult<Option<User>> {
            self.0.find_user(id).await
        }
        async fn ping(&self) -> AppResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_failed_read_back_rolls_back() {
        let memory = MemoryStore::new();
        let (user, book) = seed(&memory).await;
        let loans = service_with(Arc::new(StaleReadStore(memory.clone())), MemoryCache::new());

        let result = loans
            .borrow(BorrowRequest {
                user_id: user.id,
                book_id: book.id,
            })
            .await;
        assert!(matches!(result, Err(AppError::ConsistencyFault(_))));

        let stored = memory.find_book("123").await.unwrap().unwrap();
        assert_eq!(stored.status, BookStatus::Available);
        assert!(memory.all_loans().await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_undo_commit() {
        let memory = MemoryStore::new();
        let (user, book) = seed(&memory).await;

        let mut cache = MockCache::new();
        cache
            .expect_delete()
            .times(2)
            .returning(|_| Err(AppError::DependencyDegraded("redis down".into())));
        let loans = service_with(Arc::new(memory.clone()), cache);

        let loan = loans
            .borrow(BorrowRequest {
                user_id: user.id,
                book_id: book.id,
            })
            .await
            .unwrap();
        let stored = memory.find_book("123").await.unwrap().unwrap();
        assert_eq!(stored.status, BookStatus::Borrowed);

        let returned = loans.return_loan(ReturnRequest::any_owner(loan.id)).await.unwrap();
        assert!(returned.return_date.is_some());
        let stored = memory.find_book("123").await.unwrap().unwrap();
        assert_eq!(stored.status, BookStatus::Available);
    }

    #[tokio::test]
    async fn test_unknown_user_and_book() {
        let memory = MemoryStore::new();
        let (user, book) = seed(&memory).await;
        let loans = service_with(Arc::new(memory), MemoryCache::new());

        let no_user = loans
            .borrow(BorrowRequest {
                user_id: user.id + 100,
                book_id: book.id,
            })
            .await;
        assert!(matches!(no_user, Err(AppError::NotFound(_))));

        let no_book = loans
            .borrow(BorrowRequest {
                user_id: user.id,
                book_id: book.id + 100,
            })
            .await;
        assert!(matches!(no_book, Err(AppError::NotFound(_))));

        let no_loan = loans.return_loan(ReturnRequest::any_owner(404)).await;
        assert!(matches!(no_loan, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_return_by_other_user_is_refused() {
        let memory = MemoryStore::new();
        let (user, book) = seed(&memory).await;
        let other = memory.add_user("someone", Role::Reader).await;
        let loans = service_with(Arc::new(memory.clone()), MemoryCache::new());

        let loan = loans
            .borrow(BorrowRequest {
                user_id: user.id,
                book_id: book.id,
            })
            .await
            .unwrap();

        let result = loans.return_loan(ReturnRequest::for_user(loan.id, other.id)).await;
        assert!(matches!(result, Err(AppError::Authorization(_))));
        assert_eq!(loans.open_loans(user.id).await.unwrap().len(), 1);

        loans
            .return_loan(ReturnRequest::for_user(loan.id, user.id))
            .await
            .unwrap();
        assert!(loans.open_loans(user.id).await.unwrap().is_empty());
        assert_eq!(loans.loan_history(user.id).await.unwrap().len(), 1);
    }
}
