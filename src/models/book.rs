//! Book (catalog entry) model and related types

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::{Validate, ValidationError};

use crate::error::AppError;

/// Circulation status of a book.
///
/// Only the loan state machine changes it: `Borrowed` holds exactly while an
/// open loan references the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    Available,
    Borrowed,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Available => "available",
            BookStatus::Borrowed => "borrowed",
        }
    }
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(BookStatus::Available),
            "borrowed" => Ok(BookStatus::Borrowed),
            other => Err(AppError::Validation(format!("Unknown book status '{}'", other))),
        }
    }
}

/// Book row as stored in the database
#[derive(Debug, Clone, FromRow)]
pub struct BookRow {
    pub id: i32,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub description: String,
    pub price: Decimal,
    pub publish_date: NaiveDate,
    pub status: String,
}

/// Book model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i32,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub description: String,
    pub price: Decimal,
    pub publish_date: NaiveDate,
    pub status: BookStatus,
}

impl TryFrom<BookRow> for Book {
    type Error = AppError;

    fn try_from(row: BookRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(|_| {
            AppError::ConsistencyFault(format!(
                "Book {} has unknown status '{}' in store",
                row.id, row.status
            ))
        })?;

        Ok(Book {
            id: row.id,
            isbn: row.isbn,
            title: row.title,
            author: row.author,
            description: row.description,
            price: row.price,
            publish_date: row.publish_date,
            status,
        })
    }
}

impl Book {
    pub fn is_available(&self) -> bool {
        self.status == BookStatus::Available
    }

    /// Whether `id_or_isbn` names this book exactly, as its id or its ISBN
    pub fn is_named_by(&self, id_or_isbn: &str) -> bool {
        self.isbn == id_or_isbn || parse_book_id(id_or_isbn) == Some(self.id)
    }
}

/// Read a lookup key as a book id. Only the canonical decimal form counts:
/// "01", "+1" or " 1" are ISBN lookups, so one book has exactly one id key.
pub fn parse_book_id(id_or_isbn: &str) -> Option<i32> {
    id_or_isbn
        .parse::<i32>()
        .ok()
        .filter(|id| id.to_string() == id_or_isbn)
}

fn validate_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() && !price.is_zero() {
        let mut err = ValidationError::new("price");
        err.message = Some("Price must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Create book request. New books always start `available`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBook {
    #[validate(length(min = 1, max = 17, message = "ISBN must be 1 to 17 characters"))]
    pub isbn: String,
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[validate(custom(function = "validate_price"))]
    pub price: Decimal,
    pub publish_date: NaiveDate,
}

/// Partial update of the bibliographic fields. ISBN and status are not
/// updatable here.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateBook {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "Title must not be empty"))]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "Author must not be empty"))]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<NaiveDate>,
}

impl UpdateBook {
    /// Field validation plus the price rule the derive cannot express on an `Option`
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()?;
        if let Some(ref price) = self.price {
            validate_price(price)
                .map_err(|_| AppError::Validation("Price must not be negative".to_string()))?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.publish_date.is_none()
    }

    /// Apply the present fields onto `book`
    pub fn apply_to(&self, book: &mut Book) {
        if let Some(ref title) = self.title {
            book.title = title.clone();
        }
        if let Some(ref author) = self.author {
            book.author = author.clone();
        }
        if let Some(ref description) = self.description {
            book.description = description.clone();
        }
        if let Some(price) = self.price {
            book.price = price;
        }
        if let Some(publish_date) = self.publish_date {
            book.publish_date = publish_date;
        }
    }
}

/// Store-side selection of books, served without the cache
#[derive(Debug, Clone, PartialEq)]
pub enum BookFilter {
    All,
    Status(BookStatus),
    Author(String),
    PriceRange { min: Decimal, max: Decimal },
}

impl BookFilter {
    pub fn matches(&self, book: &Book) -> bool {
        match self {
            BookFilter::All => true,
            BookFilter::Status(status) => book.status == *status,
            BookFilter::Author(author) => book.author == *author,
            BookFilter::PriceRange { min, max } => book.price >= *min && book.price <= *max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(price: Decimal) -> CreateBook {
        CreateBook {
            isbn: "9787111544937".to_string(),
            title: "Computer Systems".to_string(),
            author: "Randal E. Bryant".to_string(),
            description: String::new(),
            price,
            publish_date: NaiveDate::from_ymd_opt(2016, 11, 1).unwrap(),
        }
    }

    #[test]
    fn test_negative_price_rejected() {
        assert!(create(Decimal::new(-150, 2)).validate().is_err());
        assert!(create(Decimal::ZERO).validate().is_ok());
        assert!(create(Decimal::new(13900, 2)).validate().is_ok());
    }

    #[test]
    fn test_only_canonical_ids_parse() {
        assert_eq!(parse_book_id("42"), Some(42));
        assert_eq!(parse_book_id("-3"), Some(-3));
        assert_eq!(parse_book_id("042"), None);
        assert_eq!(parse_book_id("+42"), None);
        assert_eq!(parse_book_id("0132350882"), None);
        assert_eq!(parse_book_id("978-0132350884"), None);
    }

    #[test]
    fn test_update_rejects_negative_price() {
        let update = UpdateBook {
            price: Some(Decimal::new(-1, 0)),
            ..Default::default()
        };
        assert!(matches!(update.check(), Err(AppError::Validation(_))));
        assert!(UpdateBook::default().is_empty());
    }

    #[test]
    fn test_empty_isbn_rejected() {
        let mut book = create(Decimal::ONE);
        book.isbn = String::new();
        assert!(book.validate().is_err());
    }

    #[test]
    fn test_unknown_row_status_is_consistency_fault() {
        let row = BookRow {
            id: 7,
            isbn: "123".into(),
            title: "t".into(),
            author: "a".into(),
            description: String::new(),
            price: Decimal::ONE,
            publish_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            status: "lost".into(),
        };
        assert!(matches!(Book::try_from(row), Err(AppError::ConsistencyFault(_))));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BookStatus::Borrowed).unwrap(),
            "\"borrowed\""
        );
        assert_eq!("available".parse::<BookStatus>().unwrap(), BookStatus::Available);
    }
}
