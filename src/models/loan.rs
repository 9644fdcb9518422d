//! Loan (borrow) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::book::Book;

/// Loan record. Never deleted; `return_date` is `None` while the loan is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BookLoan {
    pub id: i32,
    pub user_id: i32,
    pub book_id: i32,
    pub loan_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
}

impl BookLoan {
    pub fn is_open(&self) -> bool {
        self.return_date.is_none()
    }
}

/// Loan joined with the book it references, for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanWithBook {
    #[serde(flatten)]
    pub loan: BookLoan,
    pub book: Book,
}

/// Borrow request. `user_id` comes from the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowRequest {
    pub user_id: i32,
    pub book_id: i32,
}

/// Return request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnRequest {
    pub loan_id: i32,
    /// When set, the loan must belong to this user
    pub on_behalf_of: Option<i32>,
}

impl ReturnRequest {
    /// Return on behalf of whoever holds the loan (staff action)
    pub fn any_owner(loan_id: i32) -> Self {
        Self {
            loan_id,
            on_behalf_of: None,
        }
    }

    pub fn for_user(loan_id: i32, user_id: i32) -> Self {
        Self {
            loan_id,
            on_behalf_of: Some(user_id),
        }
    }
}
