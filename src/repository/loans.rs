//! Loans repository: locked transactional access for borrow/return and
//! read-only loan listings

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row, Transaction};

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, BookRow, BookStatus},
        loan::{BookLoan, LoanWithBook},
    },
};

use super::{books::BOOK_COLUMNS, StoreTransaction};

const LOAN_COLUMNS: &str = "id, user_id, book_id, loan_date, return_date";

const LOAN_WITH_BOOK_SELECT: &str = r#"
    SELECT l.id, l.user_id, l.book_id, l.loan_date, l.return_date,
           b.isbn, b.title, b.author, b.description, b.price, b.publish_date,
           b.status
    FROM book_loans l
    JOIN books b ON b.id = l.book_id
"#;

fn loan_with_book(row: &PgRow) -> AppResult<LoanWithBook> {
    let book_id: i32 = row.try_get("book_id")?;
    let book = Book::try_from(BookRow {
        id: book_id,
        isbn: row.try_get("isbn")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        publish_date: row.try_get("publish_date")?,
        status: row.try_get("status")?,
    })?;

    Ok(LoanWithBook {
        loan: BookLoan {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            book_id,
            loan_date: row.try_get("loan_date")?,
            return_date: row.try_get("return_date")?,
        },
        book,
    })
}

#[derive(Clone)]
pub struct LoansRepository {
    pool: Pool<Postgres>,
}

impl LoansRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Start a loan transaction
    pub async fn begin(&self) -> AppResult<PgLoanTransaction> {
        Ok(PgLoanTransaction {
            tx: self.pool.begin().await?,
        })
    }

    /// Open loans of a user with their books
    pub async fn get_open_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        let query = format!(
            "{} WHERE l.user_id = $1 AND l.return_date IS NULL ORDER BY l.loan_date, l.id",
            LOAN_WITH_BOOK_SELECT
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(loan_with_book).collect()
    }

    /// Full loan history of a user, most recent first
    pub async fn get_history_for_user(&self, user_id: i32) -> AppResult<Vec<LoanWithBook>> {
        let query = format!(
            "{} WHERE l.user_id = $1 ORDER BY l.loan_date DESC, l.id DESC",
            LOAN_WITH_BOOK_SELECT
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(loan_with_book).collect()
    }
}

/// Postgres transaction; row locks are `SELECT ... FOR UPDATE`
pub struct PgLoanTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgLoanTransaction {
    async fn book_for_update(&mut self, book_id: i32) -> AppResult<Option<Book>> {
        sqlx::query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE id = $1 FOR UPDATE",
            BOOK_COLUMNS
        ))
        .bind(book_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Book::try_from)
        .transpose()
    }

    async fn loan_for_update(&mut self, loan_id: i32) -> AppResult<Option<BookLoan>> {
        let loan = sqlx::query_as::<_, BookLoan>(&format!(
            "SELECT {} FROM book_loans WHERE id = $1 FOR UPDATE",
            LOAN_COLUMNS
        ))
        .bind(loan_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(loan)
    }

    async fn open_loan_exists(&mut self, user_id: i32, book_id: i32) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM book_loans
                WHERE user_id = $1 AND book_id = $2 AND return_date IS NULL
            )
            "#,
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn book(&mut self, book_id: i32) -> AppResult<Option<Book>> {
        sqlx::query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE id = $1",
            BOOK_COLUMNS
        ))
        .bind(book_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Book::try_from)
        .transpose()
    }

    async fn set_book_status(&mut self, book_id: i32, status: BookStatus) -> AppResult<()> {
        let result = sqlx::query("UPDATE books SET status = $2 WHERE id = $1")
            .bind(book_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(AppError::NotFound(format!("Book with id {} not found", book_id)));
        }
        Ok(())
    }

    async fn insert_loan(
        &mut self,
        user_id: i32,
        book_id: i32,
        loan_date: DateTime<Utc>,
    ) -> AppResult<BookLoan> {
        let loan = sqlx::query_as::<_, BookLoan>(&format!(
            r#"
            INSERT INTO book_loans (user_id, book_id, loan_date, return_date)
            VALUES ($1, $2, $3, NULL)
            RETURNING {}
            "#,
            LOAN_COLUMNS
        ))
        .bind(user_id)
        .bind(book_id)
        .bind(loan_date)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(loan)
    }

    async fn close_loan(&mut self, loan_id: i32, return_date: DateTime<Utc>) -> AppResult<BookLoan> {
        sqlx::query_as::<_, BookLoan>(&format!(
            r#"
            UPDATE book_loans SET return_date = $2
            WHERE id = $1 AND return_date IS NULL
            RETURNING {}
            "#,
            LOAN_COLUMNS
        ))
        .bind(loan_id)
        .bind(return_date)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| AppError::InvalidState(format!("Loan {} is already returned", loan_id)))
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
