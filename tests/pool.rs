use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use volley::event::Event;
use volley::pool::{self, PoolConfig, PoolState, TransferPool};
use volley::request::{self, Request, RequestState};
use volley::{Client, ClientConfig, HttpResponse, MockMultiplexer, TransferCode, VolleyError};

const BASE_URL: &str = "http://127.0.0.1:8124/";

fn fast_config() -> PoolConfig {
    PoolConfig {
        select_timeout_ms: 1,
        idle_sleep_ms: 1,
        max_failed_selects: 25,
    }
}

fn setup() -> (TransferPool, MockMultiplexer, Client) {
    let mock = MockMultiplexer::new();
    let pool = TransferPool::with_config(mock.clone(), fast_config());
    let client = Client::new(ClientConfig::with_base_url(BASE_URL), pool.clone());
    (pool, mock, client)
}

/// Record the name of every event the pool dispatches.
fn record_events(pool: &TransferPool) -> Arc<Mutex<Vec<&'static str>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    pool.events().subscribe_all(move |event: &Event| {
        events_clone.lock().push(event.name);
        Ok(())
    });
    events
}

fn aggregate(err: VolleyError) -> volley::AggregateError {
    match err {
        VolleyError::Aggregate(aggregate) => aggregate,
        other => panic!("expected an aggregate error, got {other}"),
    }
}

#[test_log::test]
fn test_add_and_remove_emit_events_in_order() {
    let (pool, _mock, client) = setup();
    let events = record_events(&pool);

    let a = pool.add(client.get("a").unwrap()).unwrap();
    let b = pool.add(client.get("b").unwrap()).unwrap();
    pool.remove(&a).unwrap();
    let c = pool.add(client.get("c").unwrap()).unwrap();

    assert_eq!(pool.all(), vec![b, c]);
    assert_eq!(pool.count(), 2);
    assert_eq!(
        *events.lock(),
        vec![
            pool::ADD_REQUEST,
            pool::ADD_REQUEST,
            pool::REMOVE_REQUEST,
            pool::ADD_REQUEST
        ]
    );
}

#[test_log::test]
fn test_sending_empty_pool_is_a_no_op() {
    let (pool, mock, _client) = setup();
    let events = record_events(&pool);

    pool.send().unwrap();

    assert!(events.lock().is_empty());
    assert_eq!(pool.state(), PoolState::Idle);
    assert_eq!(mock.handles_created(), 0);
}

#[test_log::test]
fn test_reset_always_yields_empty_idle_pool() {
    let (pool, _mock, client) = setup();
    pool.add(client.get("a").unwrap()).unwrap();
    pool.add(client.get("b").unwrap()).unwrap();
    let events = record_events(&pool);

    pool.reset().unwrap();

    assert!(pool.is_empty());
    assert_eq!(pool.state(), PoolState::Idle);
    assert_eq!(
        *events.lock(),
        vec![pool::REMOVE_REQUEST, pool::REMOVE_REQUEST, pool::RESET]
    );
}

#[test_log::test]
fn test_send_emits_lifecycle_events() {
    let (pool, mock, client) = setup();
    mock.add_response("GET /a", HttpResponse::new(200));
    let request = pool.add(client.get("a").unwrap()).unwrap();
    let events = record_events(&pool);

    pool.send().unwrap();

    assert_eq!(request.state(), RequestState::Complete);
    assert_eq!(
        *events.lock(),
        vec![
            pool::BEFORE_SEND,
            pool::MESSAGE,
            pool::REMOVE_REQUEST,
            pool::COMPLETE
        ]
    );
}

#[test_log::test]
fn test_observer_resolving_request_skips_the_transfer() {
    let (pool, mock, client) = setup();
    let request = client.get("cached").unwrap();
    request.events().subscribe(request::BEFORE_SEND, |event| {
        if let Some(request) = event.request() {
            request.set_response(HttpResponse::new(200).with_body("from cache"))?;
        }
        Ok(())
    });

    pool.add(request.clone()).unwrap();
    pool.send().unwrap();

    assert_eq!(mock.handles_created(), 0);
    assert_eq!(mock.call_count(), 0);
    assert_eq!(request.state(), RequestState::Complete);
    assert_eq!(request.response().unwrap().body, "from cache");
}

#[test_log::test]
fn test_queued_responses_complete_without_transfers() {
    let (pool, mock, client) = setup();
    let events = record_events(&pool);

    let statuses = [200, 204, 404];
    let requests: Vec<Request> = statuses
        .iter()
        .map(|status| {
            let request = client.get("queued").unwrap();
            request.queue_response(HttpResponse::new(*status));
            pool.add(request).unwrap()
        })
        .collect();

    let aggregate = aggregate(pool.send().unwrap_err());

    assert_eq!(aggregate.len(), 1);
    let failed = aggregate.errors()[0].response().expect("bad response error");
    assert_eq!(failed.status, 404);

    assert_eq!(mock.call_count(), 0);
    assert!(requests.iter().all(|r| r.state() == RequestState::Complete));
    assert!(pool.is_empty());
    assert_eq!(pool.state(), PoolState::Idle);

    let events = events.lock();
    assert!(events.contains(&pool::COMPLETE));
    assert!(!events.contains(&pool::POLLING));
}

#[test_log::test]
fn test_request_added_while_polling_completes_in_same_send() {
    let (pool, mock, client) = setup();
    mock.set_latency(2);
    mock.add_response("GET /first", HttpResponse::new(200));
    mock.add_response("GET /late", HttpResponse::new(200).with_body("late"));

    let late = client.get("late").unwrap();
    let added = Arc::new(AtomicBool::new(false));
    {
        let pool_clone = pool.clone();
        let late = late.clone();
        let added = added.clone();
        pool.events().subscribe(pool::POLLING, move |_| {
            if !added.swap(true, Ordering::SeqCst) {
                pool_clone.add(late.clone())?;
            }
            Ok(())
        });
    }

    let first = pool.add(client.get("first").unwrap()).unwrap();
    pool.send().unwrap();

    assert!(added.load(Ordering::SeqCst));
    assert_eq!(first.state(), RequestState::Complete);
    assert_eq!(late.state(), RequestState::Complete);
    assert_eq!(late.response().unwrap().body, "late");
    assert!(pool.is_empty());
}

#[test_log::test]
fn test_removing_request_mid_transfer_closes_handle_once() {
    let (pool, mock, client) = setup();
    mock.set_latency(5);
    mock.add_response("GET /slow", HttpResponse::new(200));

    let request = client.get("slow").unwrap();
    {
        let request_clone = request.clone();
        request.events().subscribe(request::POLLING_REQUEST, move |event| {
            let pool = event.pool().expect("polling carries the pool");
            pool.remove(&request_clone)?;
            Ok(())
        });
    }

    pool.add(request.clone()).unwrap();
    pool.send().unwrap();

    let handle = mock.calls()[0].handle;
    assert_eq!(mock.close_count(handle), 1);
    assert_eq!(mock.total_closes(), 1);
    assert_eq!(mock.in_flight_count(), 0);
    assert!(pool.is_empty());
    assert_ne!(request.state(), RequestState::Complete);
}

#[test_log::test]
fn test_transfer_failures_are_aggregated_while_siblings_succeed() {
    let (pool, mock, client) = setup();
    mock.add_response("GET /ok-1", HttpResponse::new(200));
    mock.add_failure("GET /down", TransferCode::CouldNotConnect, "Connection refused");
    mock.add_response("GET /ok-2", HttpResponse::new(200));

    let exceptions = Arc::new(Mutex::new(Vec::new()));
    {
        let exceptions = exceptions.clone();
        pool.events().subscribe(pool::EXCEPTION, move |event| {
            if let volley::EventContext::Exception { error, all } = &event.context {
                exceptions.lock().push((error.to_string(), all.len()));
            }
            Ok(())
        });
    }

    let ok_1 = pool.add(client.get("ok-1").unwrap()).unwrap();
    let down = pool.add(client.get("down").unwrap()).unwrap();
    let ok_2 = pool.add(client.get("ok-2").unwrap()).unwrap();

    let aggregate = aggregate(pool.send().unwrap_err());

    assert_eq!(aggregate.len(), 1);
    let VolleyError::Transfer(transfer) = &*aggregate.errors()[0] else {
        panic!("expected a transfer error");
    };
    assert_eq!(transfer.code, TransferCode::CouldNotConnect);
    assert_eq!(transfer.request, down.id());
    assert!(transfer.debug.contains("> GET /down HTTP/1.1"));

    assert_eq!(ok_1.state(), RequestState::Complete);
    assert_eq!(ok_2.state(), RequestState::Complete);
    assert_eq!(down.state(), RequestState::Error);

    let exceptions = exceptions.lock();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions[0].0.contains("Connection refused"));
    assert_eq!(exceptions[0].1, 1);
    assert_eq!(mock.total_closes(), 3);
}

#[test_log::test]
fn test_headers_are_reconciled_with_the_wire() {
    let (pool, mock, client) = setup();
    mock.add_response("POST /items", HttpResponse::new(201));

    let request = client.post("items", "{\"name\":\"bolt\"}").unwrap();
    request.set_protocol_version("1.0");
    assert!(request.header("Host").is_none());

    pool.add(request.clone()).unwrap();
    pool.send().unwrap();

    assert_eq!(request.header("Host").as_deref(), Some("127.0.0.1:8124"));
    assert_eq!(request.header("Content-Length").as_deref(), Some("15"));
    assert_eq!(request.protocol_version(), "1.0");

    let info = request.response().unwrap().info.unwrap();
    assert_eq!(info.http_code, 201);
    assert!(info.debug.unwrap().contains("> POST /items HTTP/1.0"));
}

#[test_log::test]
fn test_nested_sends_complete_every_request() {
    let (pool, mock, client) = setup();
    for _ in 0..6 {
        mock.add_response("GET /", HttpResponse::new(200));
    }
    for _ in 0..2 {
        mock.add_response("HEAD /", HttpResponse::new(200));
    }

    let called = Arc::new(AtomicUsize::new(0));
    let nested = Arc::new(Mutex::new(Vec::new()));
    let requests: Vec<Request> = (0..3).map(|_| client.get("").unwrap()).collect();

    for request in &requests {
        let client = client.clone();
        let called = called.clone();
        let nested = nested.clone();
        request.events().subscribe(request::COMPLETE, move |_| {
            let count = called.fetch_add(1, Ordering::SeqCst) + 1;
            let follow_up = client.get("")?;
            if count <= 2 {
                let client = client.clone();
                let nested = nested.clone();
                follow_up.events().subscribe(request::COMPLETE, move |_| {
                    let head = client.head("")?;
                    client.send(&head)?;
                    nested.lock().push(head);
                    Ok(())
                });
            }
            client.send(&follow_up)?;
            nested.lock().push(follow_up);
            Ok(())
        });
    }

    client.send_all(&requests).unwrap();

    assert_eq!(mock.call_count(), 8);
    assert_eq!(called.load(Ordering::SeqCst), 3);
    let nested = nested.lock();
    assert_eq!(nested.len(), 5);
    assert!(nested.iter().all(|r| r.state() == RequestState::Complete));
    assert!(requests.iter().all(|r| r.state() == RequestState::Complete));
    assert!(pool.is_empty());
    assert_eq!(pool.state(), PoolState::Idle);
}

#[test_log::test]
fn test_queued_request_sent_from_observer_skips_the_wire() {
    let (_pool, mock, client) = setup();
    mock.add_response("GET /", HttpResponse::new(200));

    let request = client.get("").unwrap();
    {
        let client = client.clone();
        request.events().subscribe(request::COMPLETE, move |_| {
            let queued = client.get("")?;
            queued.queue_response(HttpResponse::new(200));
            client.send(&queued)?;
            Ok(())
        });
    }

    client.send(&request).unwrap();
    assert_eq!(mock.call_count(), 1);
}

#[test_log::test]
fn test_failure_of_queued_request_sent_from_observer_propagates() {
    let (pool, mock, client) = setup();
    mock.add_response("GET /", HttpResponse::new(200));

    let request = client.get("").unwrap();
    {
        let client = client.clone();
        request.events().subscribe(request::COMPLETE, move |_| {
            let queued = client.get("")?;
            queued.queue_response(HttpResponse::new(404));
            client.send(&queued)?;
            Ok(())
        });
    }

    let err = client.send(&request).unwrap_err();
    assert_eq!(err.response().map(|r| r.status), Some(404));
    assert!(pool.is_empty());
    assert_eq!(pool.state(), PoolState::Idle);
}

#[test_log::test]
fn test_pool_is_reusable_after_a_failed_send() {
    let (pool, mock, client) = setup();
    mock.add_failure("GET /flaky", TransferCode::OperationTimedOut, "Timed out");
    mock.add_response("GET /flaky", HttpResponse::new(200).with_body("recovered"));

    let request = client.get("flaky").unwrap();
    pool.add(request.clone()).unwrap();
    assert!(pool.send().is_err());
    assert_eq!(request.state(), RequestState::Error);

    pool.add(request.clone()).unwrap();
    pool.send().unwrap();
    assert_eq!(request.state(), RequestState::Complete);
    assert_eq!(request.response().unwrap().body, "recovered");
}

#[test_log::test]
fn test_stalled_nested_send_yields_to_enclosing_send() {
    let mock = MockMultiplexer::new();
    let config = PoolConfig {
        max_failed_selects: 2,
        ..fast_config()
    };
    let pool = TransferPool::with_config(mock.clone(), config);
    let client = Client::new(ClientConfig::with_base_url(BASE_URL), pool.clone());
    mock.set_latency(50);
    mock.add_response("GET /outer", HttpResponse::new(200));
    mock.add_response("GET /inner", HttpResponse::new(200).with_body("inner"));

    let inner = client.get("inner").unwrap();
    let nested_result = Arc::new(Mutex::new(None));
    let outer = client.get("outer").unwrap();
    {
        let client = client.clone();
        let inner = inner.clone();
        let nested_result = nested_result.clone();
        let started = AtomicBool::new(false);
        outer.events().subscribe(request::POLLING_REQUEST, move |_| {
            if !started.swap(true, Ordering::SeqCst) {
                let result = client.send(&inner);
                *nested_result.lock() = Some(result);
            }
            Ok(())
        });
    }

    let response = client.send(&outer).unwrap();
    assert_eq!(response.status, 200);

    let nested_result = nested_result.lock().take().expect("nested send ran");
    assert!(matches!(
        nested_result,
        Err(VolleyError::MissingResponse(id)) if id == inner.id()
    ));
    assert_eq!(inner.state(), RequestState::Complete);
    assert_eq!(inner.response().unwrap().body, "inner");
    assert_eq!(mock.call_count(), 2);
    assert!(pool.is_empty());
    assert_eq!(pool.state(), PoolState::Idle);
}

#[test_log::test]
fn test_async_request_does_not_hold_up_nested_send() {
    let (pool, mock, client) = setup();
    mock.set_latency(3);
    mock.add_response("GET /outer", HttpResponse::new(200));
    mock.add_response("GET /background", HttpResponse::new(200).with_body("background"));
    mock.add_response("GET /follow-up", HttpResponse::new(200));

    let outer = client.get("outer").unwrap();
    let background = client.get("background").unwrap();
    let state_after_nested = Arc::new(Mutex::new(None));
    {
        let client = client.clone();
        let mock = mock.clone();
        let background = background.clone();
        let state_after_nested = state_after_nested.clone();
        let started = AtomicBool::new(false);
        outer.events().subscribe(request::POLLING_REQUEST, move |event| {
            if started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let pool = event.pool().expect("polling carries the pool");
            mock.set_latency(10);
            pool.add_async(background.clone())?;

            mock.set_latency(1);
            client.send(&client.get("follow-up")?)?;
            *state_after_nested.lock() = Some(background.state());
            Ok(())
        });
    }

    client.send(&outer).unwrap();

    assert_eq!(
        *state_after_nested.lock(),
        Some(RequestState::Transferring)
    );
    assert_eq!(background.state(), RequestState::Complete);
    assert_eq!(background.response().unwrap().body, "background");
    assert_eq!(mock.call_count(), 3);
    assert!(pool.is_empty());
}
