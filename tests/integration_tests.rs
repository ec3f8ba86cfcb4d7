use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use http_body_util::BodyExt;
use tower::ServiceExt;

use slotbook::bus::EventBus;
use slotbook::config::AppConfig;
use slotbook::db::{self, queries};
use slotbook::handlers;
use slotbook::handlers::webhook::sign_payload;
use slotbook::models::{AvailabilityRule, Host, MeetingType};
use slotbook::rate_limit::RateLimiter;
use slotbook::services::email::EmailProvider;
use slotbook::services::holds::SlotLocks;
use slotbook::services::signing::NoopSigning;
use slotbook::services::{self, holds};
use slotbook::state::AppState;
use slotbook::workers;

const WEBHOOK_SECRET: &str = "test-webhook-secret";

// ── Mock providers ──

struct MockEmail {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl MockEmail {
    fn new() -> (Arc<Self>, Arc<Mutex<Vec<(String, String, String)>>>) {
        let sent = Arc::new(Mutex::new(vec![]));
        (
            Arc::new(Self { sent: sent.clone() }),
            sent,
        )
    }
}

#[async_trait]
impl EmailProvider for MockEmail {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

// ── Helpers ──

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        webhook_shared_secret: WEBHOOK_SECRET.to_string(),
        signwell_base_url: "http://localhost:0".to_string(),
        signwell_api_key: "".to_string(),
        signwell_template_id: "".to_string(),
        resend_api_key: "".to_string(),
        email_from: "bookings@example.com".to_string(),
        cors_origins: vec![],
        app_url: "http://localhost:3000".to_string(),
    }
}

struct TestApp {
    state: Arc<AppState>,
    app: Router,
    emails: Arc<Mutex<Vec<(String, String, String)>>>,
}

fn test_app() -> TestApp {
    let db = db::open_shared(":memory:").unwrap();
    let bus = Arc::new(EventBus::new(db.clone()));
    let (email, emails) = MockEmail::new();

    let state = Arc::new(AppState {
        db,
        config: test_config(),
        bus,
        signing: Arc::new(NoopSigning),
        email,
        rate_limiter: RateLimiter::new(),
        slot_locks: SlotLocks::new(),
    });
    workers::start(&state).unwrap();

    seed(&state);

    TestApp {
        app: handlers::router(state.clone()),
        state,
        emails,
    }
}

fn seed(state: &Arc<AppState>) {
    let conn = holds::lock_db(&state.db);
    let now = Utc::now();

    let host = Host {
        id: "host1".to_string(),
        name: "Avery".to_string(),
        email: "avery@example.com".to_string(),
        timezone: "America/New_York".to_string(),
        created_at: now,
    };
    queries::insert_host(&conn, &host).unwrap();

    for (id, slug, requires_nda) in [
        ("mt1", "intro-call", false),
        ("mt2", "nda-call", true),
    ] {
        queries::insert_meeting_type(
            &conn,
            &MeetingType {
                id: id.to_string(),
                host_id: host.id.clone(),
                slug: slug.to_string(),
                name: slug.replace('-', " "),
                description: None,
                duration_minutes: 30,
                buffer_before_minutes: 0,
                buffer_after_minutes: 0,
                location: None,
                requires_nda,
                active: true,
                created_at: now,
            },
        )
        .unwrap();
    }

    // Tuesday 09:00-10:00 in the host's zone, unscoped
    queries::insert_rule(
        &conn,
        &AvailabilityRule {
            id: "r1".to_string(),
            host_id: host.id,
            meeting_type_id: None,
            day_of_week: 2,
            start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            effective_from: None,
            effective_until: None,
            active: true,
        },
    )
    .unwrap();
}

/// A Tuesday comfortably past the 2-hour lead time.
fn target_tuesday() -> NaiveDate {
    let mut day = Utc::now().date_naive() + Duration::days(7);
    while day.weekday() != Weekday::Tue {
        day = day.succ_opt().unwrap();
    }
    day
}

/// The two slot starts the seeded rule yields on the given Tuesday.
fn expected_starts(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let tz: Tz = "America/New_York".parse().unwrap();
    let first = tz
        .from_local_datetime(&day.and_hms_opt(9, 0, 0).unwrap())
        .single()
        .unwrap()
        .with_timezone(&Utc);
    (first, first + Duration::minutes(30))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hold_body(slot_start: DateTime<Utc>, key: &str) -> serde_json::Value {
    serde_json::json!({
        "slotStart": slot_start.to_rfc3339(),
        "slotEnd": (slot_start + Duration::minutes(30)).to_rfc3339(),
        "email": "guest@example.com",
        "name": "Guest",
        "idempotencyKey": key,
    })
}

fn confirm_body(hold_id: &str, key: &str) -> serde_json::Value {
    serde_json::json!({
        "holdId": hold_id,
        "guestName": "Guest",
        "guestTimezone": "UTC",
        "idempotencyKey": key,
    })
}

fn signed_webhook(event: &str, document_id: &str, hold_id: &str) -> Request<Body> {
    let body = serde_json::json!({
        "event": event,
        "document": {
            "id": document_id,
            "custom_fields": [{"api_id": "hold_id", "value": hold_id}],
        },
    })
    .to_string();
    let signature = sign_payload(WEBHOOK_SECRET, body.as_bytes());

    Request::builder()
        .method("POST")
        .uri("/webhooks/signwell")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-signwell-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

fn count_events(state: &Arc<AppState>, subject: &str) -> i64 {
    let conn = holds::lock_db(&state.db);
    conn.query_row(
        "SELECT COUNT(*) FROM bus_events WHERE subject = ?1",
        [subject],
        |row| row.get(0),
    )
    .unwrap()
}

async fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..(deadline_ms / 20).max(1) {
        if cond() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    cond()
}

fn key(n: u32) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, format!("test-key-{n}").as_bytes()).to_string()
}

// ── Scenario 1: happy path ──

#[tokio::test]
async fn test_happy_path_list_hold_confirm() {
    let t = test_app();
    let day = target_tuesday();
    let (first, second) = expected_starts(day);

    // Two slots offered, both available, presented in UTC
    let (status, body) = send(
        &t.app,
        get(&format!(
            "/book/intro-call/slots?startDate={day}&endDate={day}&timezone=UTC"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let slots = body["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["start"], first.to_rfc3339());
    assert_eq!(slots[1]["start"], second.to_rfc3339());
    assert!(slots.iter().all(|s| s["available"] == true));

    // Hold the first slot
    let (status, body) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let hold_id = body["holdId"].as_str().unwrap().to_string();
    assert_eq!(body["ndaRequired"], false);
    let expires_at = body["expiresAt"].as_str().unwrap();
    let expires_at: DateTime<Utc> = DateTime::parse_from_rfc3339(expires_at)
        .unwrap()
        .with_timezone(&Utc);
    let ttl = expires_at - Utc::now();
    assert!(ttl <= Duration::minutes(15) && ttl > Duration::minutes(14));
    assert_eq!(count_events(&t.state, "slot.held"), 1);

    // Confirm it
    let (status, body) = send(
        &t.app,
        post_json("/book/intro-call/confirm", confirm_body(&hold_id, &key(2))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["booking"]["status"], "confirmed");
    assert_eq!(body["booking"]["slotStart"], first.to_rfc3339());
    assert_eq!(count_events(&t.state, "booking.confirmed"), 1);
    let booking_id = body["booking"]["id"].as_str().unwrap().to_string();

    // A second viewer now sees the first slot gone
    let (_, body) = send(
        &t.app,
        get(&format!(
            "/book/intro-call/slots?startDate={day}&endDate={day}&timezone=UTC"
        )),
    )
    .await;
    let slots = body["slots"].as_array().unwrap();
    assert_eq!(slots[0]["available"], false);
    assert_eq!(slots[1]["available"], true);

    // The confirmation email flows through the notification stream
    let emails = t.emails.clone();
    assert!(
        wait_until(3000, || !emails.lock().unwrap().is_empty()).await,
        "confirmation email was never sent"
    );
    {
        let sent = t.emails.lock().unwrap();
        assert_eq!(sent[0].0, "guest@example.com");
        // The manage-booking link is built from APP_URL
        assert!(sent[0]
            .2
            .contains(&format!("http://localhost:3000/bookings/{booking_id}")));
    }
    let state = t.state.clone();
    assert!(wait_until(3000, || count_events(&state, "notify.email.sent") == 1).await);
}

// ── Scenario 2: concurrent holds ──

#[tokio::test]
async fn test_concurrent_holds_single_winner() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let a = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    );
    let b = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(2))),
    );
    let ((status_a, _), (status_b, _)) = tokio::join!(a, b);

    let mut statuses = [status_a, status_b];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::CREATED, StatusCode::CONFLICT]);

    // Exactly one hold row and one event
    {
        let conn = holds::lock_db(&t.state.db);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM holds", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
    assert_eq!(count_events(&t.state, "slot.held"), 1);
}

// ── Scenario 3: idempotent hold replay ──

#[tokio::test]
async fn test_hold_replay_returns_same_hold() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (status_a, body_a) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;
    let (status_b, body_b) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;

    assert_eq!(status_a, StatusCode::CREATED);
    assert_eq!(status_b, StatusCode::CREATED);
    assert_eq!(body_a["holdId"], body_b["holdId"]);
    assert_eq!(count_events(&t.state, "slot.held"), 1);
}

// ── Scenario 4: hold expiry ──

#[tokio::test]
async fn test_hold_expiry_frees_slot() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (_, body) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;
    let hold_id = body["holdId"].as_str().unwrap().to_string();

    // Push the hold past its TTL and run the sweep
    {
        let conn = holds::lock_db(&t.state.db);
        conn.execute(
            "UPDATE holds SET expires_at = ?1 WHERE id = ?2",
            rusqlite::params![db::fmt_ts(Utc::now() - Duration::seconds(1)), hold_id],
        )
        .unwrap();
    }
    let swept = services::holds::expire_overdue(&t.state.db, &t.state.bus, Utc::now()).unwrap();
    assert_eq!(swept, 1);

    let (status, body) = send(
        &t.app,
        get(&format!("/book/intro-call/hold/{hold_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "expired");
    assert_eq!(count_events(&t.state, "slot.released"), 1);

    // Confirming the expired hold fails
    let (status, body) = send(
        &t.app,
        post_json("/book/intro-call/confirm", confirm_body(&hold_id, &key(2))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("expired"));

    // The slot is available to hold again
    let (status, _) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(3))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

// ── Scenario 5: NDA gating ──

#[tokio::test]
async fn test_nda_gating_blocks_until_signed() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (status, body) = send(
        &t.app,
        post_json("/book/nda-call/hold", hold_body(first, &key(1))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ndaRequired"], true);
    let hold_id = body["holdId"].as_str().unwrap().to_string();

    // The NDA dispatcher creates the document off the slot.held event
    let state = t.state.clone();
    let hold_for_wait = hold_id.clone();
    assert!(
        wait_until(3000, || {
            let conn = holds::lock_db(&state.db);
            queries::get_document_by_hold(&conn, &hold_for_wait)
                .unwrap()
                .is_some()
        })
        .await,
        "NDA document was never created"
    );
    assert_eq!(count_events(&t.state, "nda.created"), 1);

    // Confirm before signing: rejected
    let (status, body) = send(
        &t.app,
        post_json("/book/nda-call/confirm", confirm_body(&hold_id, &key(2))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("NDA"));

    // The provider reports the signature
    let (status, _) = send(&t.app, signed_webhook("document_completed", "env_1", &hold_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count_events(&t.state, "nda.signed"), 1);

    // Now the confirm goes through
    let (status, body) = send(
        &t.app,
        post_json("/book/nda-call/confirm", confirm_body(&hold_id, &key(3))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["booking"]["status"], "confirmed");
    assert_eq!(count_events(&t.state, "booking.confirmed"), 1);
}

// ── Scenario 6: webhook replay ──

#[tokio::test]
async fn test_webhook_replay_returns_cached_response() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (_, body) = send(
        &t.app,
        post_json("/book/nda-call/hold", hold_body(first, &key(1))),
    )
    .await;
    let hold_id = body["holdId"].as_str().unwrap().to_string();

    let state = t.state.clone();
    let hold_for_wait = hold_id.clone();
    wait_until(3000, || {
        let conn = holds::lock_db(&state.db);
        queries::get_document_by_hold(&conn, &hold_for_wait)
            .unwrap()
            .is_some()
    })
    .await;

    let (status_a, body_a) =
        send(&t.app, signed_webhook("document_completed", "env_1", &hold_id)).await;
    let (status_b, body_b) =
        send(&t.app, signed_webhook("document_completed", "env_1", &hold_id)).await;

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a, body_b);
    // No second transition, no second event
    assert_eq!(count_events(&t.state, "nda.signed"), 1);
}

#[tokio::test]
async fn test_webhook_failure_is_retryable() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    // The callback arrives before any document exists: it fails with a
    // retryable 500 and the record is marked failed, not completed
    let (status, _) = send(&t.app, signed_webhook("document_sent", "env_9", "hold-x")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(count_events(&t.state, "nda.sent"), 0);

    // Backfill the hold and its document, as the NDA dispatcher would
    {
        let conn = holds::lock_db(&t.state.db);
        let now = Utc::now();
        queries::insert_hold(
            &conn,
            &slotbook::models::Hold {
                id: "hold-x".to_string(),
                meeting_type_id: "mt2".to_string(),
                slot_start: first,
                slot_end: first + Duration::minutes(30),
                guest_email: "guest@example.com".to_string(),
                guest_name: None,
                status: slotbook::models::HoldStatus::Active,
                expires_at: now + Duration::minutes(15),
                idempotency_key: key(7),
                created_at: now,
            },
        )
        .unwrap();
        let hold = queries::get_hold(&conn, "hold-x").unwrap().unwrap();
        slotbook::services::documents::create_for_hold(
            &conn,
            &hold,
            Some("env_9".to_string()),
            now,
        )
        .unwrap();
    }

    // The provider's retry of the identical payload now succeeds
    let (status, _) = send(&t.app, signed_webhook("document_sent", "env_9", "hold-x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count_events(&t.state, "nda.sent"), 1);
}

// ── Webhook authentication ──

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let t = test_app();

    let body = serde_json::json!({
        "event": "document_completed",
        "document": {"id": "env_1", "custom_fields": [{"api_id": "hold_id", "value": "h1"}]},
    })
    .to_string();

    // Missing signature
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/signwell")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Wrong signature
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/signwell")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-signwell-signature", sign_payload("wrong-secret", body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_rejects_malformed_payload() {
    let t = test_app();
    let body = "not json".to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/signwell")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-signwell-signature", sign_payload(WEBHOOK_SECRET, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ── Validation and rate limiting ──

#[tokio::test]
async fn test_unknown_slug_is_404() {
    let t = test_app();
    let (status, _) = send(&t.app, get("/book/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_slots_rejects_bad_dates() {
    let t = test_app();
    let (status, _) = send(
        &t.app,
        get("/book/intro-call/slots?startDate=nope&endDate=2025-04-08&timezone=UTC"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &t.app,
        get("/book/intro-call/slots?startDate=2025-04-08&endDate=2025-04-01&timezone=UTC"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &t.app,
        get("/book/intro-call/slots?startDate=2025-04-08&endDate=2025-04-09&timezone=Mars/Olympus"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hold_creation_is_rate_limited() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    for n in 0..5 {
        let request = post_json("/book/intro-call/hold", hold_body(first, &key(n)));
        let (status, _) = send(&t.app, request).await;
        // First wins, the rest conflict; all count against the budget
        assert!(status == StatusCode::CREATED || status == StatusCode::CONFLICT);
    }

    let response = t
        .app
        .clone()
        .oneshot(post_json("/book/intro-call/hold", hold_body(first, &key(9))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn test_hold_requires_uuid_idempotency_key() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());
    let mut body = hold_body(first, "not-a-uuid");
    body["idempotencyKey"] = serde_json::json!("not-a-uuid");
    let (status, _) = send(&t.app, post_json("/book/intro-call/hold", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ── Hold release over HTTP ──

#[tokio::test]
async fn test_release_hold_via_delete() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (_, body) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;
    let hold_id = body["holdId"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/book/intro-call/hold/{hold_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "released");

    let released = count_events(&t.state, "slot.released");
    assert_eq!(released, 1);

    // Releasing twice is a client error
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/book/intro-call/hold/{hold_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ── Idempotent confirm over HTTP ──

#[tokio::test]
async fn test_confirm_replay_returns_same_booking() {
    let t = test_app();
    let (first, _) = expected_starts(target_tuesday());

    let (_, body) = send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first, &key(1))),
    )
    .await;
    let hold_id = body["holdId"].as_str().unwrap().to_string();

    let (status_a, body_a) = send(
        &t.app,
        post_json("/book/intro-call/confirm", confirm_body(&hold_id, &key(2))),
    )
    .await;
    let (status_b, body_b) = send(
        &t.app,
        post_json("/book/intro-call/confirm", confirm_body(&hold_id, &key(2))),
    )
    .await;

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a["booking"]["id"], body_b["booking"]["id"]);
    assert_eq!(count_events(&t.state, "booking.confirmed"), 1);
}

// ── Realtime gateway ──

#[tokio::test]
async fn test_realtime_stream_emits_connected_then_events() {
    let t = test_app();

    let response = t
        .app
        .clone()
        .oneshot(get("/realtime/slots/mt1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let mut body = response.into_body();

    let first = tokio::time::timeout(StdDuration::from_secs(2), body.frame())
        .await
        .expect("no connected frame")
        .unwrap()
        .unwrap();
    let first = String::from_utf8(first.into_data().unwrap().to_vec()).unwrap();
    assert!(first.contains("event: connected"));
    assert!(first.contains("mt1"));

    // A hold on the watched meeting type reaches the stream
    let (first_slot, _) = expected_starts(target_tuesday());
    send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first_slot, &key(1))),
    )
    .await;

    let next = tokio::time::timeout(StdDuration::from_secs(2), body.frame())
        .await
        .expect("no slot.held frame")
        .unwrap()
        .unwrap();
    let next = String::from_utf8(next.into_data().unwrap().to_vec()).unwrap();
    assert!(next.contains("event: slot.held"));
    assert!(next.contains("meeting_type_id"));
}

#[tokio::test]
async fn test_realtime_stream_filters_other_meeting_types() {
    let t = test_app();

    // Watch the NDA meeting type, act on the other one
    let response = t
        .app
        .clone()
        .oneshot(get("/realtime/slots/mt2"))
        .await
        .unwrap();
    let mut body = response.into_body();

    let _connected = tokio::time::timeout(StdDuration::from_secs(2), body.frame())
        .await
        .expect("no connected frame")
        .unwrap()
        .unwrap();

    let (first_slot, _) = expected_starts(target_tuesday());
    send(
        &t.app,
        post_json("/book/intro-call/hold", hold_body(first_slot, &key(1))),
    )
    .await;

    // Nothing for mt2 arrives before the timeout
    let silent =
        tokio::time::timeout(StdDuration::from_millis(500), body.frame()).await;
    assert!(silent.is_err(), "unexpected frame for a different meeting type");
}
