//! Loan endpoints

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    error::AppResult,
    models::{BookLoan, LoanWithBook, ReturnRequest},
    AppState,
};

use super::AuthenticatedUser;

/// Return a loan. Readers may only return their own loans; administrators
/// may return any loan.
pub async fn return_loan(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i32>,
) -> AppResult<Json<BookLoan>> {
    let request = if claims.is_admin() {
        ReturnRequest::any_owner(loan_id)
    } else {
        ReturnRequest::for_user(loan_id, claims.user_id)
    };

    let loan = state.services.loans.return_loan(request).await?;
    Ok(Json(loan))
}

/// Open loans of the authenticated user
pub async fn current_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanWithBook>>> {
    let loans = state.services.loans.open_loans(claims.user_id).await?;
    Ok(Json(loans))
}

/// Loan history of the authenticated user, newest first
pub async fn loan_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanWithBook>>> {
    let loans = state.services.loans.loan_history(claims.user_id).await?;
    Ok(Json(loans))
}
