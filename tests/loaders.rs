//! The HTTP loader against a live local endpoint: initial snapshot, then
//! diffs as the served body changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use gnmic::loaders::{LoaderConfig, LoaderContext};
use gnmic::shutdown::ShutdownSignal;
use gnmic::testing::next_addr;

/// Serves `bodies[min(hits, len-1)]` and counts hits.
async fn serve_bodies(bodies: Vec<&'static str>) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let addr = next_addr();
    let listener = TcpListener::bind(addr).await.expect("bind test server");
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };

            let bodies = bodies.clone();
            let counter = Arc::clone(&counter);

            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let index = counter.fetch_add(1, Ordering::SeqCst).min(bodies.len() - 1);
                    let content = bodies[index];
                    async move {
                        Response::builder()
                            .header("Content-Type", "application/json")
                            .body(http_body_util::Full::new(bytes::Bytes::from_static(
                                content.as_bytes(),
                            )))
                    }
                });

                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

#[tokio::test]
async fn http_loader_emits_snapshot_then_diff() {
    let (addr, _hits) = serve_bodies(vec![
        r#"{ "10.10.10.10": {"username": "admin"}, "10.10.10.11": {} }"#,
        r#"{ "10.10.10.11": {}, "10.10.10.12": {} }"#,
    ])
    .await;

    let raw = format!(
        r#"
type: http
url: http://{addr}/targets
interval: 50ms
"#
    );
    let config: Box<dyn LoaderConfig> = serde_yaml::from_str(&raw).expect("loader config parses");

    let (tx, mut rx) = mpsc::channel(8);
    let loader = config
        .build(LoaderContext {
            out: tx,
            shutdown: ShutdownSignal::noop(),
            locker: None,
        })
        .await
        .expect("loader builds");
    tokio::spawn(loader);

    // initial snapshot: a pure add of everything known
    let initial = rx.recv().await.expect("initial snapshot");
    assert!(initial.del.is_empty());
    assert_eq!(initial.add.len(), 2);
    assert_eq!(
        initial.add["10.10.10.10"].username.as_deref(),
        Some("admin")
    );

    // second poll: the diff
    let op = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("diff arrives")
        .expect("channel open");

    assert_eq!(op.del, vec!["10.10.10.10"]);
    assert_eq!(op.add.len(), 1);
    assert!(op.add.contains_key("10.10.10.12"));
    assert_eq!(op.add["10.10.10.12"].address, "10.10.10.12");
}

#[tokio::test]
async fn http_loader_survives_a_dead_endpoint() {
    // nothing listens here
    let addr = next_addr();

    let raw = format!(
        r#"
type: http
url: http://{addr}/targets
interval: 20ms
"#
    );
    let config: Box<dyn LoaderConfig> = serde_yaml::from_str(&raw).expect("loader config parses");

    let (tx, mut rx) = mpsc::channel(8);
    let loader = config
        .build(LoaderContext {
            out: tx,
            shutdown: ShutdownSignal::noop(),
            locker: None,
        })
        .await
        .expect("loader builds");
    tokio::spawn(loader);

    // no snapshot, no synthetic deletes, just retries
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}
