//! Order lifecycle through the tracker actor.

use std::sync::Arc;
use std::time::Duration;

use lighter_account::UserEvent;
use lighter_core::{
    ClientOrderId, Fill, MarketId, OrderIntent, OrderSide, OrderState, OrderUpdate, Price, Size,
};
use lighter_orders::{
    spawn_order_tracker, CancelOutcome, FakeOrderQuery, OrderEvent, OrderTrackerHandle, SubmitOutcome,
    TrackerConfig, TrackerError,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    handle: OrderTrackerHandle,
    user: mpsc::UnboundedSender<UserEvent>,
    query: Arc<FakeOrderQuery>,
    events: mpsc::UnboundedReceiver<OrderEvent>,
    shutdown: CancellationToken,
}

async fn harness() -> Harness {
    let query = Arc::new(FakeOrderQuery::new());
    let (user, user_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let (handle, _join) =
        spawn_order_tracker(TrackerConfig::default(), query.clone(), user_rx, shutdown.clone());
    let events = handle.subscribe().await.unwrap();
    Harness {
        handle,
        user,
        query,
        events,
        shutdown,
    }
}

fn limit_buy() -> OrderIntent {
    OrderIntent::limit(
        MarketId(0),
        OrderSide::Buy,
        Price::new(dec!(100)),
        Size::new(dec!(10)),
    )
}

fn fill(order_id: u64, trade_id: u64, amount: Decimal) -> Fill {
    Fill {
        order_id,
        trade_id,
        market: MarketId(0),
        price: Price::new(dec!(100)),
        amount: Size::new(amount),
        fee: dec!(0.01),
        timestamp: trade_id,
    }
}

fn status(order_id: u64, state: OrderState, sequence: u64) -> OrderUpdate {
    OrderUpdate {
        order_id,
        client_order_index: None,
        market: MarketId(0),
        state,
        sequence,
        filled_amount: None,
        timestamp: sequence,
    }
}

async fn next(events: &mut mpsc::UnboundedReceiver<OrderEvent>) -> OrderEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for order event")
        .expect("tracker closed")
}

async fn next_transition(events: &mut mpsc::UnboundedReceiver<OrderEvent>) -> (OrderState, OrderState) {
    loop {
        if let OrderEvent::Transition { order, from } = next(events).await {
            return (from, order.state);
        }
    }
}

async fn open(h: &mut Harness, exchange_id: u64) -> ClientOrderId {
    let intent = limit_buy();
    let id = intent.client_order_id.clone();
    h.handle.register(intent).await.unwrap();
    h.handle
        .submit_outcome(
            id.clone(),
            SubmitOutcome::Accepted {
                exchange_order_id: Some(exchange_id),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCreate, OrderState::Open)
    );
    id
}

#[tokio::test]
async fn partial_then_full_fill() {
    let mut h = harness().await;
    let id = open(&mut h, 7).await;

    h.user.send(UserEvent::Fill(fill(7, 1, dec!(4)))).unwrap();
    match next(&mut h.events).await {
        OrderEvent::Fill {
            client_order_id,
            fill,
        } => {
            assert_eq!(client_order_id, id);
            assert_eq!(fill.amount, Size::new(dec!(4)));
        }
        other => panic!("expected fill, got {other:?}"),
    }
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::Open, OrderState::PartiallyFilled)
    );
    assert_eq!(h.handle.order(&id).unwrap().filled_amount, Size::new(dec!(4)));

    h.user.send(UserEvent::Fill(fill(7, 2, dec!(6)))).unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PartiallyFilled, OrderState::Filled)
    );
    let order = h.handle.order(&id).unwrap();
    assert_eq!(order.filled_amount, Size::new(dec!(10)));
    assert!(h.handle.open_orders().is_empty());

    match h.handle.begin_cancel(id).await {
        Err(TrackerError::NotCancelable { state, .. }) => assert_eq!(state, OrderState::Filled),
        other => panic!("expected NotCancelable, got {other:?}"),
    }
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn submit_timeout_is_reconciled_without_duplicates() {
    let mut h = harness().await;
    let intent = limit_buy();
    let id = intent.client_order_id.clone();
    let order = h.handle.register(intent).await.unwrap();

    h.handle
        .submit_outcome(id.clone(), SubmitOutcome::Unknown)
        .await
        .unwrap();
    match next(&mut h.events).await {
        OrderEvent::Reconciling { order } => assert_eq!(order.state, OrderState::PendingCreate),
        other => panic!("expected reconciling, got {other:?}"),
    }

    // The order did reach the venue
    let mut found = status(21, OrderState::Open, 1);
    found.client_order_index = Some(order.client_order_index);
    h.query.set(order.client_order_index, found);

    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCreate, OrderState::Open)
    );
    assert_eq!(h.query.calls(), vec![order.client_order_index]);

    let tracked = h.handle.order(&id).unwrap();
    assert_eq!(tracked.exchange_order_id, Some(21));
    assert!(!tracked.reconciling);

    // The late stream echo neither duplicates nor moves the order
    h.user.send(UserEvent::Order(status(21, OrderState::Open, 2))).unwrap();
    h.user.send(UserEvent::Fill(fill(21, 9, dec!(10)))).unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::Open, OrderState::Filled)
    );
    assert_eq!(h.handle.open_orders().len(), 0);
    assert_eq!(h.handle.order(&id).unwrap().filled_amount, Size::new(dec!(10)));
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn unknown_submission_fails_when_venue_never_saw_it() {
    let mut h = harness().await;
    let intent = limit_buy();
    let id = intent.client_order_id.clone();
    h.handle.register(intent).await.unwrap();
    h.handle
        .submit_outcome(id.clone(), SubmitOutcome::Unknown)
        .await
        .unwrap();

    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCreate, OrderState::Failed)
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn duplicate_fill_and_status_are_idempotent() {
    let mut h = harness().await;
    let id = open(&mut h, 7).await;

    for _ in 0..2 {
        h.user.send(UserEvent::Fill(fill(7, 1, dec!(3)))).unwrap();
        h.user
            .send(UserEvent::Order(status(7, OrderState::PartiallyFilled, 4)))
            .unwrap();
    }
    // Marker: the next distinct update
    h.user
        .send(UserEvent::Order(status(7, OrderState::Canceled, 5)))
        .unwrap();

    let mut fills = 0;
    let mut transitions = Vec::new();
    loop {
        match next(&mut h.events).await {
            OrderEvent::Fill { .. } => fills += 1,
            OrderEvent::Transition { order, from } => {
                transitions.push((from, order.state));
                if order.state == OrderState::Canceled {
                    break;
                }
            }
            OrderEvent::Reconciling { .. } => {}
        }
    }
    assert_eq!(fills, 1);
    assert_eq!(
        transitions,
        vec![
            (OrderState::Open, OrderState::PartiallyFilled),
            (OrderState::PartiallyFilled, OrderState::Canceled),
        ]
    );
    assert_eq!(h.handle.order(&id).unwrap().filled_amount, Size::new(dec!(3)));
    h.shutdown.cancel();
}

#[tokio::test]
async fn reconnect_cancels_orders_missing_from_snapshot() {
    let mut h = harness().await;
    let kept = open(&mut h, 7).await;
    let gone = open(&mut h, 8).await;

    h.user
        .send(UserEvent::Reconciled {
            open_orders: vec![status(7, OrderState::Open, 10)],
            reconnect: true,
        })
        .unwrap();

    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::Open, OrderState::Canceled)
    );
    assert_eq!(h.handle.order(&gone).unwrap().state, OrderState::Canceled);
    assert_eq!(h.handle.order(&kept).unwrap().state, OrderState::Open);
    h.shutdown.cancel();
}

#[tokio::test]
async fn stream_events_before_acknowledgement_are_kept() {
    let mut h = harness().await;
    let intent = limit_buy();
    let id = intent.client_order_id.clone();
    let order = h.handle.register(intent).await.unwrap();

    let mut resting = status(55, OrderState::Open, 1);
    resting.client_order_index = Some(order.client_order_index);
    h.user.send(UserEvent::Order(resting)).unwrap();
    h.user.send(UserEvent::Fill(fill(55, 1, dec!(4)))).unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCreate, OrderState::Open)
    );
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::Open, OrderState::PartiallyFilled)
    );

    // The REST ack lands last
    h.handle
        .submit_outcome(
            id.clone(),
            SubmitOutcome::Accepted {
                exchange_order_id: Some(55),
            },
        )
        .await
        .unwrap();
    // Round trip so the ack has been applied
    h.handle.register(limit_buy()).await.unwrap();

    let tracked = h.handle.order(&id).unwrap();
    assert_eq!(tracked.state, OrderState::PartiallyFilled);
    assert_eq!(tracked.filled_amount, Size::new(dec!(4)));

    h.user.send(UserEvent::Fill(fill(55, 2, dec!(6)))).unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PartiallyFilled, OrderState::Filled)
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn acknowledgement_during_unsent_cancel_restores_open() {
    let mut h = harness().await;
    let intent = limit_buy();
    let id = intent.client_order_id.clone();
    h.handle.register(intent).await.unwrap();

    h.handle.begin_cancel(id.clone()).await.unwrap();
    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCreate, OrderState::PendingCancel)
    );

    h.handle
        .submit_outcome(
            id.clone(),
            SubmitOutcome::Accepted {
                exchange_order_id: Some(55),
            },
        )
        .await
        .unwrap();
    h.handle
        .cancel_outcome(id.clone(), CancelOutcome::NotSent)
        .await
        .unwrap();

    assert_eq!(
        next_transition(&mut h.events).await,
        (OrderState::PendingCancel, OrderState::Open)
    );
    let tracked = h.handle.order(&id).unwrap();
    assert_eq!(tracked.state, OrderState::Open);
    assert_eq!(tracked.exchange_order_id, Some(55));
    h.shutdown.cancel();
}
