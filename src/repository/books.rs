//! Books repository for database operations

use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::book::{parse_book_id, Book, BookFilter, BookRow, CreateBook, UpdateBook},
};

pub(crate) const BOOK_COLUMNS: &str =
    "id, isbn, title, author, description, price, publish_date, status";

fn into_books(rows: Vec<BookRow>) -> AppResult<Vec<Book>> {
    rows.into_iter().map(Book::try_from).collect()
}

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get book by numeric ID or by ISBN (id match first)
    pub async fn get_by_id_or_isbn(&self, id_or_isbn: &str) -> AppResult<Option<Book>> {
        let query = format!(
            "SELECT {} FROM books WHERE id = $1 OR isbn = $2 ORDER BY (id = $1) DESC LIMIT 1",
            BOOK_COLUMNS
        );
        // Non-canonical keys can only match the ISBN; 0 is never a SERIAL id.
        sqlx::query_as::<_, BookRow>(&query)
            .bind(parse_book_id(id_or_isbn).unwrap_or(0))
            .bind(id_or_isbn)
            .fetch_optional(&self.pool)
            .await?
            .map(Book::try_from)
            .transpose()
    }

    /// List books matching a filter
    pub async fn list(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        let rows = match filter {
            BookFilter::All => {
                sqlx::query_as::<_, BookRow>(&format!(
                    "SELECT {} FROM books ORDER BY id",
                    BOOK_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
            BookFilter::Status(status) => {
                sqlx::query_as::<_, BookRow>(&format!(
                    "SELECT {} FROM books WHERE status = $1 ORDER BY id",
                    BOOK_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            BookFilter::Author(author) => {
                sqlx::query_as::<_, BookRow>(&format!(
                    "SELECT {} FROM books WHERE author = $1 ORDER BY id",
                    BOOK_COLUMNS
                ))
                .bind(author)
                .fetch_all(&self.pool)
                .await?
            }
            BookFilter::PriceRange { min, max } => {
                sqlx::query_as::<_, BookRow>(&format!(
                    "SELECT {} FROM books WHERE price BETWEEN $1 AND $2 ORDER BY id",
                    BOOK_COLUMNS
                ))
                .bind(min)
                .bind(max)
                .fetch_all(&self.pool)
                .await?
            }
        };

        into_books(rows)
    }

    /// Create a new book
    pub async fn create(&self, book: &CreateBook) -> AppResult<Book> {
        let query = format!(
            r#"
            INSERT INTO books (isbn, title, author, description, price, publish_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'available')
            RETURNING {}
            "#,
            BOOK_COLUMNS
        );

        let row = sqlx::query_as::<_, BookRow>(&query)
            .bind(&book.isbn)
            .bind(&book.title)
            .bind(&book.author)
            .bind(&book.description)
            .bind(book.price)
            .bind(book.publish_date)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match AppError::from(e) {
                AppError::InvalidState(_) => AppError::InvalidState(format!(
                    "A book with ISBN {} already exists",
                    book.isbn
                )),
                other => other,
            })?;

        Book::try_from(row)
    }

    /// Update bibliographic fields, leaving absent ones untouched
    pub async fn update(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
        let query = format!(
            r#"
            UPDATE books SET
                title = COALESCE($2, title),
                author = COALESCE($3, author),
                description = COALESCE($4, description),
                price = COALESCE($5, price),
                publish_date = COALESCE($6, publish_date)
            WHERE id = $1
            RETURNING {}
            "#,
            BOOK_COLUMNS
        );

        sqlx::query_as::<_, BookRow>(&query)
            .bind(id)
            .bind(&changes.title)
            .bind(&changes.author)
            .bind(&changes.description)
            .bind(changes.price)
            .bind(changes.publish_date)
            .fetch_optional(&self.pool)
            .await?
            .map(Book::try_from)
            .transpose()
    }

    /// Delete a book that no loan references.
    ///
    /// The book row is locked first so a concurrent borrow cannot slip a loan
    /// in between the check and the delete.
    pub async fn delete(&self, id: i32) -> AppResult<Option<Book>> {
        let mut tx = self.pool.begin().await?;

        let book = sqlx::query_as::<_, BookRow>(&format!(
            "SELECT {} FROM books WHERE id = $1 FOR UPDATE",
            BOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let book = match book {
            Some(row) => Book::try_from(row)?,
            None => return Ok(None),
        };

        let has_loans: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM book_loans WHERE book_id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

        if has_loans {
            return Err(AppError::InvalidState(format!(
                "Book {} has loan records and cannot be deleted",
                id
            )));
        }

        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(book))
    }
}
