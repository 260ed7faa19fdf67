mod common;

use assert_matches::assert_matches;
use chat_checkout::{entities::product, errors::ServiceError};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

const USER: i64 = 1001;

#[tokio::test]
async fn add_creates_cart_and_snapshots_price() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;

    let cart = app.state.carts.add_item(USER, mug.id, 3).await.unwrap();

    assert!(cart.cart.active);
    assert_eq!(cart.cart.user_id, USER);
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 3);
    assert_eq!(cart.items[0].unit_price(), dec!(9.99));
    assert_eq!(cart.total(), dec!(29.97));
}

#[tokio::test]
async fn adding_same_product_merges_lines_and_keeps_first_price() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;

    app.state.carts.add_item(USER, mug.id, 1).await.unwrap();

    // A later catalog price change does not touch the existing line.
    let mut repriced: product::ActiveModel = mug.clone().into();
    repriced.price_minor = Set(1_500);
    repriced.update(&*app.state.db).await.unwrap();

    let cart = app.state.carts.add_item(USER, mug.id, 2).await.unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 3);
    assert_eq!(cart.items[0].unit_price(), dec!(9.99));
}

#[tokio::test]
async fn add_rejects_bad_quantity_and_unavailable_products() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;

    assert_matches!(
        app.state.carts.add_item(USER, mug.id, 0).await,
        Err(ServiceError::ValidationError(_))
    );

    let missing = Uuid::new_v4();
    assert_matches!(
        app.state.carts.add_item(USER, missing, 1).await,
        Err(ServiceError::ProductUnavailable(id)) if id == missing
    );

    app.set_product_active(&mug, false).await;
    assert_matches!(
        app.state.carts.add_item(USER, mug.id, 1).await,
        Err(ServiceError::ProductUnavailable(_))
    );
    assert!(app.state.carts.get_active_cart(USER).await.unwrap().is_none());
}

#[tokio::test]
async fn adjust_to_zero_removes_line() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;
    let tea = app.seed_product("Tea", dec!(4.50), 10).await;

    app.state.carts.add_item(USER, mug.id, 2).await.unwrap();
    app.state.carts.add_item(USER, tea.id, 1).await.unwrap();

    let cart = app
        .state
        .carts
        .adjust_qty(USER, mug.id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.item(mug.id).unwrap().quantity, 3);

    let cart = app
        .state
        .carts
        .adjust_qty(USER, mug.id, -3)
        .await
        .unwrap()
        .unwrap();
    assert!(cart.item(mug.id).is_none());
    assert_eq!(cart.total(), dec!(4.50));

    let cart = app
        .state
        .carts
        .adjust_qty(USER, tea.id, -5)
        .await
        .unwrap()
        .unwrap();
    assert!(cart.is_empty());
    assert!(cart.cart.active);
}

#[tokio::test]
async fn adjusting_or_removing_absent_products_is_a_no_op() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;

    assert!(app
        .state
        .carts
        .adjust_qty(USER, mug.id, 1)
        .await
        .unwrap()
        .is_none());

    app.state.carts.add_item(USER, mug.id, 1).await.unwrap();
    let other = Uuid::new_v4();
    let cart = app
        .state
        .carts
        .adjust_qty(USER, other, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.items.len(), 1);

    let cart = app
        .state
        .carts
        .remove_item(USER, other)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.items.len(), 1);

    let cart = app
        .state
        .carts
        .remove_item(USER, mug.id)
        .await
        .unwrap()
        .unwrap();
    assert!(cart.is_empty());
}

#[tokio::test]
async fn deactivate_is_compare_and_set() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;
    let cart = app.state.carts.add_item(USER, mug.id, 1).await.unwrap();

    assert!(app.state.carts.deactivate(cart.cart.id).await.unwrap());
    assert!(!app.state.carts.deactivate(cart.cart.id).await.unwrap());
    assert!(app.state.carts.get_active_cart(USER).await.unwrap().is_none());

    // The next add opens a fresh cart.
    let fresh = app.state.carts.add_item(USER, mug.id, 1).await.unwrap();
    assert_ne!(fresh.cart.id, cart.cart.id);
}

#[tokio::test]
async fn carts_are_isolated_per_user() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 10).await;

    app.state.carts.add_item(1, mug.id, 1).await.unwrap();
    app.state.carts.add_item(2, mug.id, 5).await.unwrap();

    let one = app.state.carts.get_active_cart(1).await.unwrap().unwrap();
    let two = app.state.carts.get_active_cart(2).await.unwrap().unwrap();
    assert_ne!(one.cart.id, two.cart.id);
    assert_eq!(one.items[0].quantity, 1);
    assert_eq!(two.items[0].quantity, 5);
}

#[tokio::test]
async fn concurrent_adds_for_one_user_are_not_lost() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(9.99), 1_000).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let carts = app.state.carts.clone();
        let product_id = mug.id;
        handles.push(tokio::spawn(async move {
            carts.add_item(USER, product_id, 1).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let cart = app.state.carts.get_active_cart(USER).await.unwrap().unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 20);
    assert_eq!(cart.total(), dec!(199.80));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_edits_for_one_user_stay_consistent() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Mug", dec!(1.00), 10_000).await;
    let pen = app.seed_product("Pen", dec!(0.50), 10_000).await;
    app.state.carts.add_item(USER, mug.id, 100).await.unwrap();

    let mut handles = Vec::new();
    let mut expected_mug = 100;
    for i in 0..48 {
        let carts = app.state.carts.clone();
        let (mug_id, pen_id) = (mug.id, pen.id);
        expected_mug += match i % 3 {
            0 => 3,
            1 => 2,
            _ => -1,
        };
        handles.push(tokio::spawn(async move {
            let mug_edit = match i % 3 {
                0 => carts.add_item(USER, mug_id, 3).await.map(|_| ()),
                1 => carts.adjust_qty(USER, mug_id, 2).await.map(|_| ()),
                _ => carts.adjust_qty(USER, mug_id, -1).await.map(|_| ()),
            };
            let pen_edit = match i % 4 {
                0 => carts.add_item(USER, pen_id, 2).await.map(|_| ()),
                1 => carts.adjust_qty(USER, pen_id, -1).await.map(|_| ()),
                2 => carts.adjust_qty(USER, pen_id, 1).await.map(|_| ()),
                _ => carts.remove_item(USER, pen_id).await.map(|_| ()),
            };
            (mug_edit, pen_edit)
        }));
    }
    for handle in handles {
        let (mug_edit, pen_edit) = handle.await.unwrap();
        mug_edit.unwrap();
        pen_edit.unwrap();
    }

    let cart = app.state.carts.get_active_cart(USER).await.unwrap().unwrap();
    assert_eq!(cart.item(mug.id).unwrap().quantity, expected_mug);
    assert!(cart.items.iter().all(|item| item.quantity > 0));
    assert!(cart.items.len() <= 2);
    let lines_per_product = |id| cart.items.iter().filter(|item| item.product_id == id).count();
    assert_eq!(lines_per_product(mug.id), 1);
    assert!(lines_per_product(pen.id) <= 1);
}
