//! Browser and page session behaviour against the fake browser.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cdp_pipe::events::NETWORK_EVENTS;
use cdp_pipe::wait::WaitOutcome;
use cdp_pipe::{Browser, BrowserOptions, CdpError, PageState, PrintOptions, WaitStrategy};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{reply, reply_error, sample_pdf, spawn_fake, FakeChrome, FakeChromeConfig};
use tokio_util::sync::CancellationToken;

async fn started_browser(options: BrowserOptions, fake: &FakeChrome) -> Browser {
    let browser = Browser::with_dispatcher(options, fake.dispatcher.clone());
    browser.start().await.expect("handshake");
    browser
}

#[tokio::test]
async fn start_is_idempotent_and_records_version() {
    let fake = FakeChrome::spawn(FakeChromeConfig::default());
    let browser = started_browser(BrowserOptions::default(), &fake).await;
    browser.start().await.unwrap();

    assert_eq!(fake.log.count("Browser.getVersion"), 1);
    let version = browser.version().unwrap();
    assert_eq!(version.product, "HeadlessChrome/124.0.0.0");
    assert_eq!(version.protocol_version, "1.3");
}

#[tokio::test]
async fn startup_times_out_when_browser_never_answers() {
    let (dispatcher, log) = spawn_fake(|_| Vec::new());
    let options = BrowserOptions {
        startup_timeout_ms: 200,
        ..BrowserOptions::default()
    };
    let browser = Browser::with_dispatcher(options, dispatcher);

    let started = Instant::now();
    let err = browser.start().await.unwrap_err();
    assert!(matches!(err, CdpError::Startup(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(log.count("Browser.getVersion") >= 1);
    assert!(matches!(browser.create_page().await, Err(CdpError::NotStarted)));
}

#[tokio::test]
async fn startup_retries_until_liveness_probe_succeeds() {
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    let (dispatcher, _log) = spawn_fake(move |frame| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            vec![(Duration::ZERO, reply_error(frame, -32000, "not ready"))]
        } else {
            vec![(Duration::ZERO, reply(frame, json!({ "product": "HeadlessChrome" })))]
        }
    });
    let browser = Browser::with_dispatcher(BrowserOptions::default(), dispatcher);
    browser.start().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(browser.is_started());
}

#[tokio::test]
async fn render_streams_pdf_and_closes_handle() {
    let fake = FakeChrome::spawn(FakeChromeConfig::default());
    let browser = started_browser(BrowserOptions::default(), &fake).await;
    let page = browser.create_page().await.unwrap();
    assert_eq!(page.state(), PageState::Unloaded);

    let cancel = CancellationToken::new();
    let mut sink = Vec::new();
    let outcome = page
        .render(
            "<html><body>Hello</body></html>",
            &mut sink,
            PrintOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(sink, sample_pdf());
    assert!(sink.starts_with(b"%PDF-"));
    assert!(sink.ends_with(b"%%EOF\n"));
    assert_eq!(outcome.bytes_written, sink.len() as u64);
    assert!(outcome.zones.is_empty());
    assert_eq!(page.state(), PageState::Ready);
    assert_eq!(fake.stats.closed_streams.load(Ordering::SeqCst), 1);

    let print = &fake.log.frames("Page.printToPDF")[0];
    assert_eq!(print["params"]["transferMode"], "ReturnAsStream");
    assert_eq!(print["params"]["printBackground"], true);
    assert_eq!(print["sessionId"], page.session_id());

    page.close().await;
    assert_eq!(page.state(), PageState::Closed);
    assert_eq!(fake.log.count("Target.closeTarget"), 1);
    let err = page
        .set_content("<p>again</p>", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::PageClosed));
}

#[tokio::test]
async fn page_domain_and_frame_id_are_resolved_once() {
    let fake = FakeChrome::spawn(FakeChromeConfig::default());
    let browser = started_browser(BrowserOptions::default(), &fake).await;
    let page = browser.create_page().await.unwrap();
    let cancel = CancellationToken::new();

    page.set_content("<p>1</p>", &cancel).await.unwrap();
    page.set_content("<p>2</p>", &cancel).await.unwrap();

    assert_eq!(fake.log.count("Page.enable"), 1);
    assert_eq!(fake.log.count("Page.getFrameTree"), 1);
    assert_eq!(fake.log.count("Network.enable"), 0);
    let content = fake.log.frames("Page.setDocumentContent");
    assert_eq!(content.len(), 2);
    assert_eq!(content[1]["params"]["frameId"], "F1");
    assert_eq!(content[1]["params"]["html"], "<p>2</p>");
}

#[tokio::test]
async fn inline_data_is_written_without_io_read() {
    let fake = FakeChrome::spawn(FakeChromeConfig {
        inline: true,
        ..FakeChromeConfig::default()
    });
    let browser = started_browser(BrowserOptions::default(), &fake).await;
    let page = browser.create_page().await.unwrap();
    let cancel = CancellationToken::new();

    let mut sink = Vec::new();
    let outcome = page
        .render("<p>tiny</p>", &mut sink, PrintOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(sink, sample_pdf());
    assert_eq!(outcome.bytes_written, sink.len() as u64);
    assert_eq!(fake.log.count("IO.read"), 0);
    assert_eq!(fake.log.count("IO.close"), 0);
}

#[tokio::test]
async fn signature_zones_are_reported_with_print() {
    let fake = FakeChrome::spawn(FakeChromeConfig {
        zones: json!([
            { "id": "signature-area-a", "x": 0, "y": 0, "width": 100, "height": 50 },
            { "id": "signature-area-b", "x": 0, "y": 900, "width": 100, "height": 50 }
        ]),
        ..FakeChromeConfig::default()
    });
    let browser = started_browser(BrowserOptions::default(), &fake).await;
    let page = browser.create_page().await.unwrap();
    let cancel = CancellationToken::new();

    let mut sink = Vec::new();
    let outcome = page
        .render(
            "<div id=\"signature-area-a\"></div>",
            &mut sink,
            PrintOptions::default().with_signature_zones(),
            &cancel,
        )
        .await
        .unwrap();
    let ids: Vec<_> = outcome.zones.iter().map(|zone| zone.id.as_str()).collect();
    assert_eq!(ids, vec!["signature-area-a", "signature-area-b"]);
    assert_eq!(outcome.zones[1].y, 900.0);
}

#[tokio::test]
async fn javascript_variable_wait_times_out_without_error() {
    let fake = FakeChrome::spawn(FakeChromeConfig::default());
    let options = BrowserOptions {
        wait_strategy: WaitStrategy::JAVASCRIPT_VARIABLE,
        wait_variable: Some("window.renderDone".into()),
        wait_variable_value: Some("true".into()),
        wait_timeout_ms: Some(100),
        ..BrowserOptions::default()
    };
    let browser = started_browser(options, &fake).await;
    let page = browser.create_page().await.unwrap();

    let started = Instant::now();
    let outcome = page
        .set_content("<script></script>", &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert!(fake.log.count("Runtime.evaluate") >= 1);
}

#[tokio::test]
async fn unanswered_wait_poll_leaves_dispatcher_usable() {
    // Runtime.evaluate never gets a reply, so every poll is cut short by the deadline.
    let (dispatcher, log) = spawn_fake(|frame| {
        let result = match frame["method"].as_str().unwrap_or_default() {
            "Runtime.evaluate" => return Vec::new(),
            "Target.createTarget" => json!({ "targetId": "T1" }),
            "Target.attachToTarget" => json!({ "sessionId": "S1" }),
            "Page.getFrameTree" => json!({ "frameTree": { "frame": { "id": "F1" } } }),
            _ => json!({}),
        };
        vec![(Duration::ZERO, reply(frame, result))]
    });
    let options = BrowserOptions {
        wait_strategy: WaitStrategy::JAVASCRIPT_VARIABLE,
        wait_variable: Some("window.".repeat(64) + "done"),
        wait_variable_value: Some("true".into()),
        wait_timeout_ms: Some(100),
        ..BrowserOptions::default()
    };
    let browser = Browser::with_dispatcher(options, dispatcher.clone());
    browser.start().await.unwrap();
    let page = browser.create_page().await.unwrap();

    let outcome = page
        .set_content("<p></p>", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert_eq!(dispatcher.pending_count(), 0);

    dispatcher
        .send("Browser.getVersion", json!({}), None)
        .await
        .expect("pipe still framed after an abandoned poll");
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(log.count("Runtime.evaluate"), 1);
}

#[tokio::test]
async fn network_idle_listeners_are_removed_after_wait() {
    let fake = FakeChrome::spawn(FakeChromeConfig::default());
    let options = BrowserOptions {
        wait_strategy: WaitStrategy::NETWORK_IDLE,
        wait_timeout_ms: Some(2_000),
        ..BrowserOptions::default()
    };
    let browser = started_browser(options, &fake).await;
    let page = browser.create_page().await.unwrap();

    let outcome = page
        .set_content("<img src=\"x.png\">", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Satisfied(WaitStrategy::NETWORK_IDLE));
    assert_eq!(fake.log.count("Network.enable"), 1);
    for method in NETWORK_EVENTS {
        assert_eq!(fake.dispatcher.listener_count(method), 0, "{method}");
    }
}

#[tokio::test]
async fn network_idle_listeners_are_removed_when_content_fails() {
    let (dispatcher, _log) = spawn_fake(|frame| {
        let method = frame["method"].as_str().unwrap_or_default();
        let result = match method {
            "Browser.getVersion" => json!({ "product": "HeadlessChrome" }),
            "Target.createTarget" => json!({ "targetId": "T1" }),
            "Target.attachToTarget" => json!({ "sessionId": "S1" }),
            "Page.getFrameTree" => json!({ "frameTree": { "frame": { "id": "F1" } } }),
            "Page.setDocumentContent" => {
                return vec![(Duration::ZERO, reply_error(frame, -32000, "No frame"))]
            }
            _ => json!({}),
        };
        vec![(Duration::ZERO, reply(frame, result))]
    });
    let options = BrowserOptions {
        wait_strategy: WaitStrategy::NETWORK_IDLE | WaitStrategy::LOAD,
        ..BrowserOptions::default()
    };
    let browser = Browser::with_dispatcher(options, dispatcher.clone());
    browser.start().await.unwrap();
    let page = browser.create_page().await.unwrap();

    let err = page
        .set_content("<p>x</p>", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_protocol());
    for method in NETWORK_EVENTS {
        assert_eq!(dispatcher.listener_count(method), 0, "{method}");
    }
}

#[tokio::test]
async fn render_permits_bound_concurrent_prints() {
    let fake = FakeChrome::spawn(FakeChromeConfig {
        read_delay: Duration::from_millis(5),
        ..FakeChromeConfig::default()
    });
    let options = BrowserOptions {
        max_concurrent_renders: 2,
        ..BrowserOptions::default()
    };
    let browser = Arc::new(started_browser(options, &fake).await);

    let jobs = (0..6).map(|_| {
        let browser = browser.clone();
        async move {
            let page = browser.create_page().await.unwrap();
            let mut sink = Vec::new();
            page.render(
                "<p>job</p>",
                &mut sink,
                PrintOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            page.close().await;
            sink
        }
    });
    for pdf in join_all(jobs).await {
        assert_eq!(pdf, sample_pdf());
    }

    assert!(fake.stats.max_open_streams.load(Ordering::SeqCst) <= 2);
    assert_eq!(fake.stats.closed_streams.load(Ordering::SeqCst), 6);
    assert_eq!(browser.render_semaphore().available_permits(), 2);
}

#[tokio::test]
async fn cancellation_releases_permit_and_stream() {
    let fake = FakeChrome::spawn(FakeChromeConfig {
        read_delay: Duration::from_millis(20),
        chunk_size: 8,
        ..FakeChromeConfig::default()
    });
    let options = BrowserOptions {
        max_concurrent_renders: 1,
        ..BrowserOptions::default()
    };
    let browser = started_browser(options, &fake).await;
    let page = browser.create_page().await.unwrap();
    let cancel = CancellationToken::new();
    page.set_content("<p>slow</p>", &cancel).await.unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });
    let mut sink = Vec::new();
    let err = page
        .print_to_pdf(&mut sink, PrintOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CdpError::Cancelled));
    assert!(sink.len() < sample_pdf().len());

    assert_eq!(browser.render_semaphore().available_permits(), 1);
    for _ in 0..100 {
        if fake.stats.closed_streams.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fake.stats.closed_streams.load(Ordering::SeqCst), 1);
    assert_eq!(page.state(), PageState::Ready);
}
