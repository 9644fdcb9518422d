//! Data models for the loan server

pub mod book;
pub mod loan;
pub mod user;

// Re-export commonly used types
pub use book::{parse_book_id, Book, BookFilter, BookStatus, CreateBook, UpdateBook};
pub use loan::{BookLoan, BorrowRequest, LoanWithBook, ReturnRequest};
pub use user::{Role, User, UserClaims};
