//! In-process store for tests and single-node development.
//!
//! Every book and loan row has its own async lock. `*_for_update` reads take
//! that lock and keep it until the transaction commits, rolls back or is
//! dropped, the same way Postgres row locks behave. Writes are staged inside
//! the transaction and applied atomically on commit, so readers never see a
//! half-applied borrow or return.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::{AppError, AppResult},
    models::{
        parse_book_id, Book, BookFilter, BookLoan, BookStatus, CreateBook, LoanWithBook, Role,
        UpdateBook, User,
    },
};

use super::{Store, StoreTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Book(i32),
    Loan(i32),
}

#[derive(Default)]
struct Tables {
    books: BTreeMap<i32, Book>,
    loans: BTreeMap<i32, BookLoan>,
    users: BTreeMap<i32, User>,
    next_book_id: i32,
    next_loan_id: i32,
    next_user_id: i32,
}

fn next_id(counter: &mut i32) -> i32 {
    *counter += 1;
    *counter
}

impl Tables {
    fn joined(&self, loan: &BookLoan) -> Option<LoanWithBook> {
        self.books.get(&loan.book_id).map(|book| LoanWithBook {
            loan: loan.clone(),
            book: book.clone(),
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    row_locks: Arc<Mutex<HashMap<RowKey, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; user management proper is not part of this store
    pub async fn add_user(&self, username: &str, role: Role) -> User {
        let mut tables = self.tables.lock().await;
        let user = User {
            id: next_id(&mut tables.next_user_id),
            username: username.to_string(),
            password_hash: String::new(),
            role,
        };
        tables.users.insert(user.id, user.clone());
        user
    }

    /// Every loan ever recorded, ordered by id
    pub async fn all_loans(&self) -> Vec<BookLoan> {
        self.tables.lock().await.loans.values().cloned().collect()
    }

    async fn lock_row(&self, key: RowKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.row_locks.lock().await;
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            held: HashMap::new(),
            status_writes: HashMap::new(),
            loan_writes: BTreeMap::new(),
        }))
    }

    async fn find_book(&self, id_or_isbn: &str) -> AppResult<Option<Book>> {
        let tables = self.tables.lock().await;
        let by_id = parse_book_id(id_or_isbn).and_then(|id| tables.books.get(&id));
        let book = by_id.or_else(|| tables.books.values().find(|b| b.isbn == id_or_isbn));
        Ok(book.cloned())
    }

    async fn list_books(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .books
            .values()
            .filter(|book| filter.matches(book))
            .cloned()
            .collect())
    }

    async fn insert_book(&self, book: &CreateBook) -> AppResult<Book> {
        let mut tables = self.tables.lock().await;
        if tables.books.values().any(|b| b.isbn == book.isbn) {
            return Err(AppError::InvalidState(format!(
                "A book with ISBN {} already exists",
                book.isbn
            )));
        }

        let created = Book {
            id: next_id(&mut tables.next_book_id),
            isbn: book.isbn.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            description: book.description.clone(),
            price: book.price,
            publish_date: book.publish_date,
            status: BookStatus::Available,
        };
        tables.books.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_book(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.books.get_mut(&id).map(|book| {
            changes.apply_to(book);
            book.clone()
        }))
    }

    async fn delete_book(&self, id: i32) -> AppResult<Option<Book>> {
        let _row = self.lock_row(RowKey::Book(id)).await;
        let mut tables = self.tables.lock().await;
        if !tables.books.contains_key(&id) {
            return Ok(None);
        }
        if tables.loans.values().any(|loan| loan.book_id == id) {
            return Err(AppError::InvalidState(format!(
                "Book {} has loan records and cannot be deleted",
                id
            )));
        }
        Ok(tables.books.remove(&id))
    }

    async fn open_loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        let tables = self.tables.lock().await;
        let mut loans: Vec<LoanWithBook> = tables
            .loans
            .values()
            .filter(|loan| loan.user_id == user_id && loan.is_open())
            .filter_map(|loan| tables.joined(loan))
            .collect();
        loans.sort_by_key(|l| (l.loan.loan_date, l.loan.id));
        Ok(loans)
    }

    async fn loans_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        let tables = self.tables.lock().await;
        let mut loans: Vec<LoanWithBook> = tables
            .loans
            .values()
            .filter(|loan| loan.user_id == user_id)
            .filter_map(|loan| tables.joined(loan))
            .collect();
        loans.sort_by_key(|l| std::cmp::Reverse((l.loan.loan_date, l.loan.id)));
        Ok(loans)
    }

    async fn find_user(&self, id: i32) -> AppResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Transaction over a [`MemoryStore`]
pub struct MemoryTransaction {
    store: MemoryStore,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    status_writes: HashMap<i32, BookStatus>,
    loan_writes: BTreeMap<i32, BookLoan>,
}

impl MemoryTransaction {
    async fn lock(&mut self, key: RowKey) {
        if !self.held.contains_key(&key) {
            let guard = self.store.lock_row(key).await;
            self.held.insert(key, guard);
        }
    }

    async fn read_book(&self, book_id: i32) -> Option<Book> {
        let tables = self.store.tables.lock().await;
        tables.books.get(&book_id).cloned().map(|mut book| {
            if let Some(status) = self.status_writes.get(&book_id) {
                book.status = *status;
            }
            book
        })
    }

    async fn read_loan(&self, loan_id: i32) -> Option<BookLoan> {
        if let Some(loan) = self.loan_writes.get(&loan_id) {
            return Some(loan.clone());
        }
        self.store.tables.lock().await.loans.get(&loan_id).cloned()
    }

    /// Committed loans overlaid with this transaction's writes
    async fn visible_loans(&self) -> Vec<BookLoan> {
        let tables = self.store.tables.lock().await;
        let mut loans: BTreeMap<i32, BookLoan> = tables.loans.clone();
        loans.extend(self.loan_writes.clone());
        loans.into_values().collect()
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn book_for_update(&mut self, book_id: i32) -> AppResult<Option<Book>> {
        self.lock(RowKey::Book(book_id)).await;
        Ok(self.read_book(book_id).await)
    }

    async fn loan_for_update(&mut self, loan_id: i32) -> AppResult<Option<BookLoan>> {
        self.lock(RowKey::Loan(loan_id)).await;
        Ok(self.read_loan(loan_id).await)
    }

    async fn open_loan_exists(&mut self, user_id: i32, book_id: i32) -> AppResult<bool> {
        Ok(self
            .visible_loans()
            .await
            .iter()
            .any(|loan| loan.user_id == user_id && loan.book_id == book_id && loan.is_open()))
    }

    async fn book(&mut self, book_id: i32) -> AppResult<Option<Book>> {
        Ok(self.read_book(book_id).await)
    }

    async fn set_book_status(&mut self, book_id: i32, status: BookStatus) -> AppResult<()> {
        if self.read_book(book_id).await.is_none() {
            return Err(AppError::NotFound(format!("Book with id {} not found", book_id)));
        }
        self.status_writes.insert(book_id, status);
        Ok(())
    }

    async fn insert_loan(
        &mut self,
        user_id: i32,
        book_id: i32,
        loan_date: DateTime<Utc>,
    ) -> AppResult<BookLoan> {
        // Same guarantees as the foreign keys and the one-open-loan-per-book index.
        if self
            .visible_loans()
            .await
            .iter()
            .any(|loan| loan.book_id == book_id && loan.is_open())
        {
            return Err(AppError::InvalidState(format!(
                "Book {} already has an open loan",
                book_id
            )));
        }

        let id = {
            let mut tables = self.store.tables.lock().await;
            if !tables.users.contains_key(&user_id) || !tables.books.contains_key(&book_id) {
                return Err(AppError::InvalidState(format!(
                    "Loan references a missing user {} or book {}",
                    user_id, book_id
                )));
            }
            next_id(&mut tables.next_loan_id)
        };

        let loan = BookLoan {
            id,
            user_id,
            book_id,
            loan_date,
            return_date: None,
        };
        self.loan_writes.insert(id, loan.clone());
        Ok(loan)
    }

    async fn close_loan(&mut self, loan_id: i32, return_date: DateTime<Utc>) -> AppResult<BookLoan> {
        let mut loan = self
            .read_loan(loan_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", loan_id)))?;

        if !loan.is_open() {
            return Err(AppError::InvalidState(format!("Loan {} is already returned", loan_id)));
        }

        loan.return_date = Some(return_date);
        self.loan_writes.insert(loan_id, loan.clone());
        Ok(loan)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTransaction {
            store,
            held,
            status_writes,
            loan_writes,
        } = *self;

        {
            let mut tables = store.tables.lock().await;
            for (book_id, status) in status_writes {
                if let Some(book) = tables.books.get_mut(&book_id) {
                    book.status = status;
                }
            }
            tables.loans.extend(loan_writes);
        }

        // Row locks go only after the writes are visible.
        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}
