//! Borrow/return behaviour over the in-memory store

mod common;

use std::sync::Arc;

use bookloan_server::{
    models::{BookStatus, BorrowRequest, ReturnRequest},
    AppError,
};

use common::TestApp;

#[tokio::test]
async fn test_borrow_reject_return_reborrow() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let bob = app.reader("bob").await;
    let book = app.book("123", "Clean Code", "Robert C. Martin").await;
    let loans = &app.services.loans;

    let loan = loans
        .borrow(BorrowRequest {
            user_id: alice.id,
            book_id: book.id,
        })
        .await
        .unwrap();
    assert_eq!(loan.user_id, alice.id);
    assert!(loan.is_open());
    assert_eq!(app.stored_status("123").await, BookStatus::Borrowed);

    let rejected = loans
        .borrow(BorrowRequest {
            user_id: bob.id,
            book_id: book.id,
        })
        .await;
    match rejected {
        Err(AppError::InvalidState(msg)) => assert!(msg.contains("not available"), "{}", msg),
        other => panic!("expected InvalidState, got {:?}", other),
    }

    let returned = loans.return_loan(ReturnRequest::any_owner(loan.id)).await.unwrap();
    assert!(returned.return_date.is_some());
    assert_eq!(app.stored_status("123").await, BookStatus::Available);

    let second = loans
        .borrow(BorrowRequest {
            user_id: bob.id,
            book_id: book.id,
        })
        .await
        .unwrap();
    assert_eq!(second.user_id, bob.id);
    assert_ne!(second.id, loan.id);
    app.assert_status_matches_loans().await;
}

#[tokio::test]
async fn test_same_user_cannot_borrow_twice() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let book = app.book("123", "Clean Code", "Robert C. Martin").await;
    let request = BorrowRequest {
        user_id: alice.id,
        book_id: book.id,
    };

    app.services.loans.borrow(request).await.unwrap();
    match app.services.loans.borrow(request).await {
        Err(AppError::InvalidState(msg)) => {
            assert!(msg.contains("already borrowed"), "{}", msg);
            assert!(msg.contains("not returned"), "{}", msg);
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert_eq!(app.store.all_loans().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_borrows_have_one_winner() {
    let app = Arc::new(TestApp::new());
    let book = app.book("123", "Clean Code", "Robert C. Martin").await;

    let mut users = Vec::new();
    for i in 0..16 {
        users.push(app.reader(&format!("reader{}", i)).await);
    }

    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let loans = app.services.loans.clone();
            let request = BorrowRequest {
                user_id: user.id,
                book_id: book.id,
            };
            tokio::spawn(async move { loans.borrow(request).await })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(AppError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(app.store.all_loans().await.len(), 1);
    assert_eq!(app.stored_status("123").await, BookStatus::Borrowed);
    app.assert_status_matches_loans().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_returns_close_once() {
    let app = Arc::new(TestApp::new());
    let alice = app.reader("alice").await;
    let book = app.book("123", "Clean Code", "Robert C. Martin").await;
    let loan = app
        .services
        .loans
        .borrow(BorrowRequest {
            user_id: alice.id,
            book_id: book.id,
        })
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let loans = app.services.loans.clone();
            tokio::spawn(async move { loans.return_loan(ReturnRequest::any_owner(loan.id)).await })
        })
        .collect();

    let mut closed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => closed += 1,
            Err(AppError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    assert_eq!(closed, 1);
    assert_eq!(app.stored_status("123").await, BookStatus::Available);
}

#[tokio::test]
async fn test_second_return_keeps_first_return_date() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let book = app.book("123", "Clean Code", "Robert C. Martin").await;
    let loans = &app.services.loans;

    let loan = loans
        .borrow(BorrowRequest {
            user_id: alice.id,
            book_id: book.id,
        })
        .await
        .unwrap();
    let first = loans.return_loan(ReturnRequest::any_owner(loan.id)).await.unwrap();

    let second = loans.return_loan(ReturnRequest::any_owner(loan.id)).await;
    assert!(matches!(second, Err(AppError::InvalidState(_))));

    let stored = app.store.all_loans().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].return_date, first.return_date);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_traffic_keeps_status_in_step_with_loans() {
    let app = Arc::new(TestApp::new());
    let mut books = Vec::new();
    for i in 0..4 {
        books.push(app.book(&format!("isbn-{}", i), &format!("Title {}", i), "Author").await);
    }
    let mut users = Vec::new();
    for i in 0..6 {
        users.push(app.reader(&format!("reader{}", i)).await);
    }

    let mut handles = Vec::new();
    for round in 0..5 {
        for (u, user) in users.iter().enumerate() {
            let loans = app.services.loans.clone();
            let user_id = user.id;
            let book_id = books[(u + round) % books.len()].id;
            handles.push(tokio::spawn(async move {
                if let Ok(loan) = loans.borrow(BorrowRequest { user_id, book_id }).await {
                    if (u + round) % 2 == 0 {
                        loans
                            .return_loan(ReturnRequest::for_user(loan.id, user_id))
                            .await
                            .unwrap();
                    }
                }
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    app.assert_status_matches_loans().await;
}

#[tokio::test]
async fn test_open_loans_and_history() {
    let app = TestApp::new();
    let alice = app.reader("alice").await;
    let first = app.book("111", "Clean Code", "Robert C. Martin").await;
    let second = app.book("222", "Clean Architecture", "Robert C. Martin").await;
    let loans = &app.services.loans;

    let kept = loans
        .borrow(BorrowRequest {
            user_id: alice.id,
            book_id: first.id,
        })
        .await
        .unwrap();
    let returned = loans
        .borrow(BorrowRequest {
            user_id: alice.id,
            book_id: second.id,
        })
        .await
        .unwrap();
    loans
        .return_loan(ReturnRequest::for_user(returned.id, alice.id))
        .await
        .unwrap();

    let open = loans.open_loans(alice.id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].loan.id, kept.id);
    assert_eq!(open[0].book.isbn, "111");
    assert_eq!(open[0].book.status, BookStatus::Borrowed);

    let history = loans.loan_history(alice.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].loan.id, returned.id);
}
