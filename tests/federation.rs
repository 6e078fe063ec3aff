//! Processor-level federation tests against in-process stub endpoints.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use seisgate::config::AppConfig;
use seisgate::error::FederatorError;
use seisgate::metrics::Metrics;
use seisgate::processor::{ProcessedResponse, RequestProcessor};
use seisgate::server::{query, AppContext};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

type StubHandler =
    Arc<dyn Fn(&str, &str) -> (u16, Vec<u8>) + Send + Sync>;

/// Spawn a one-shot HTTP stub; the handler receives `(path, query)` for GET
/// requests and returns `(status, body)`.
async fn spawn_stub(handler: StubHandler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let path = req.uri().path().to_string();
                        let query = req.uri().query().unwrap_or("").to_string();
                        // POST routing requests carry the selection in the
                        // body; the stubs here key off path and query only.
                        let _ = req.into_body().collect().await;
                        let (status, body) = handler(&path, &query);
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });
    addr
}

fn test_context(mutate: impl FnOnce(&mut AppConfig)) -> AppContext {
    let mut config = AppConfig::default();
    config.federation.streaming_timeout = 10;
    mutate(&mut config);
    AppContext::with_metrics(config, Metrics::install()).unwrap()
}

async fn collect_stream(resp: ProcessedResponse) -> Bytes {
    match resp {
        ProcessedResponse::Cached(body) => body,
        ProcessedResponse::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

#[tokio::test]
async fn routing_204_yields_nodata_without_endpoint_calls() {
    let endpoint_hits = Arc::new(AtomicUsize::new(0));
    let hits = endpoint_hits.clone();
    let _endpoint = spawn_stub(Arc::new(move |_, _| {
        hits.fetch_add(1, Ordering::SeqCst);
        (200, b"data".to_vec())
    }))
    .await;

    let routing = spawn_stub(Arc::new(|_, _| (204, Vec::new()))).await;
    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", routing));

    let req = query::parse_get(
        "dataselect",
        "net=CH&sta=FOO&cha=LHZ&start=2019-01-01&end=2019-01-05",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();

    assert!(matches!(err, FederatorError::NoData));
    assert_eq!(endpoint_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn routing_failure_surfaces_as_routing_error() {
    // Bind and immediately drop a listener so the port refuses connections.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = dead.local_addr().unwrap();
    drop(dead);

    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", addr));
    let req = query::parse_get(
        "dataselect",
        "net=CH&start=2019-01-01&end=2019-01-02",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();
    assert!(matches!(err, FederatorError::RoutingUnavailable(_)));
    assert!(err.to_string().contains("Error while routing"));
}

#[tokio::test]
async fn duration_cap_rejects_before_any_endpoint_call() {
    let endpoint_hits = Arc::new(AtomicUsize::new(0));
    let hits = endpoint_hits.clone();
    let endpoint = spawn_stub(Arc::new(move |_, _| {
        hits.fetch_add(1, Ordering::SeqCst);
        (200, b"data".to_vec())
    }))
    .await;

    let routing_body = format!(
        "http://{}/fdsnws/dataselect/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-02T00:00:01\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| {
        c.routing.url = format!("http://{}/routing", routing);
        c.federation.max_stream_epoch_duration = Some(1);
    });

    // One day plus one second.
    let req = query::parse_get(
        "dataselect",
        "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-02T00:00:01",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();

    assert!(matches!(err, FederatorError::PayloadTooLarge(_)));
    assert_eq!(endpoint_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_endpoint_yields_nodata() {
    let endpoint = spawn_stub(Arc::new(|_, _| (204, Vec::new()))).await;
    let routing_body = format!(
        "http://{}/fdsnws/dataselect/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", routing));
    let req = query::parse_get(
        "dataselect",
        "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-05",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();
    assert!(matches!(err, FederatorError::NoData));
}

#[tokio::test]
async fn total_upstream_outage_is_distinguished_from_nodata() {
    // Bind-and-drop so the endpoint refuses connections.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = dead.local_addr().unwrap();
    drop(dead);

    let routing_body = format!(
        "http://{}/fdsnws/dataselect/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", routing));
    let req = query::parse_get(
        "dataselect",
        "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-05",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();
    assert!(matches!(err, FederatorError::UpstreamUnavailable));
}

#[tokio::test]
async fn upstream_413_fails_the_whole_request() {
    let endpoint = spawn_stub(Arc::new(|_, _| (413, b"too large".to_vec()))).await;
    let routing_body = format!(
        "http://{}/fdsnws/dataselect/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", routing));
    let req = query::parse_get(
        "dataselect",
        "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-05",
    )
    .unwrap();
    let err = RequestProcessor::new(ctx).process(req).await.unwrap_err();
    assert!(matches!(err, FederatorError::PayloadTooLarge(_)));
}

#[tokio::test]
async fn json_split_align_merges_adjacent_chunks() {
    // The epoch spans 10 days and split_duration is 5: the worker issues
    // two sequential sub-requests whose responses repeat the boundary
    // record.
    let endpoint = spawn_stub(Arc::new(|_, query: &str| {
        if query.contains("starttime=2019-01-01") {
            (200, br#"[{"t":1,"v":10},{"t":2,"v":20}]"#.to_vec())
        } else {
            (200, br#"[{"t":2,"v":20},{"t":3,"v":30}]"#.to_vec())
        }
    }))
    .await;
    let routing_body = format!(
        "http://{}/eidaws/wfcatalog/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-11T00:00:00\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| {
        c.routing.url = format!("http://{}/routing", routing);
        c.federation.split_duration = 5;
    });
    let req = query::parse_get(
        "wfcatalog",
        "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-11",
    )
    .unwrap();

    let resp = RequestProcessor::new(ctx).process(req).await.unwrap();
    let body = collect_stream(resp).await;
    assert_eq!(
        body,
        Bytes::from_static(br#"[{"t":1,"v":10},{"t":2,"v":20},{"t":3,"v":30}]"#)
    );
}

#[tokio::test]
async fn station_xml_merges_channels_across_endpoints() {
    let station_a = "<FDSNStationXML><Network code=\"CH\">\
        <Station code=\"AAA\"><Channel code=\"HHZ\"><SampleRate>120</SampleRate></Channel>\
        </Station></Network></FDSNStationXML>";
    let station_b = "<FDSNStationXML><Network code=\"CH\">\
        <Station code=\"AAA\"><Channel code=\"HHN\"><SampleRate>120</SampleRate></Channel>\
        </Station></Network></FDSNStationXML>";

    let endpoint_a =
        spawn_stub(Arc::new(move |_, _| (200, station_a.as_bytes().to_vec()))).await;
    let endpoint_b =
        spawn_stub(Arc::new(move |_, _| (200, station_b.as_bytes().to_vec()))).await;

    let routing_body = format!(
        "http://{}/fdsnws/station/1/query\n\
         CH AAA -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n\
         \n\
         http://{}/fdsnws/station/1/query\n\
         CH AAA -- HHN 2019-01-01T00:00:00 2019-01-05T00:00:00\n",
        endpoint_a, endpoint_b
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| c.routing.url = format!("http://{}/routing", routing));
    let req = query::parse_get(
        "station",
        "net=CH&sta=AAA&level=channel&start=2019-01-01&end=2019-01-05",
    )
    .unwrap();

    let resp = RequestProcessor::new(ctx).process(req).await.unwrap();
    let body = collect_stream(resp).await;
    let xml = String::from_utf8(body.to_vec()).unwrap();

    assert!(xml.starts_with("<?xml"));
    assert!(xml.ends_with("</FDSNStationXML>"));
    // One merged network and station carrying both channels.
    assert_eq!(xml.matches("<Network").count(), 1);
    assert_eq!(xml.matches("<Station").count(), 1);
    assert!(xml.contains("\"HHZ\""));
    assert!(xml.contains("\"HHN\""));
}

#[tokio::test]
async fn cache_hit_is_byte_identical() {
    let endpoint = spawn_stub(Arc::new(|_, _| {
        (200, b"#Network|Station\nCH|HASLI\n".to_vec())
    }))
    .await;
    let routing_body = format!(
        "http://{}/fdsnws/availability/1/query\n\
         CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n",
        endpoint
    );
    let routing =
        spawn_stub(Arc::new(move |_, _| (200, routing_body.clone().into_bytes()))).await;

    let ctx = test_context(|c| {
        c.routing.url = format!("http://{}/routing", routing);
        c.cache.enabled = true;
    });
    let make_req = || {
        query::parse_get(
            "availability",
            "net=CH&sta=HASLI&cha=HHZ&start=2019-01-01&end=2019-01-05",
        )
        .unwrap()
    };

    let processor = RequestProcessor::new(ctx);
    let first = processor.process(make_req()).await.unwrap();
    let first_body = collect_stream(first).await;

    let second = processor.process(make_req()).await.unwrap();
    assert!(matches!(second, ProcessedResponse::Cached(_)));
    let second_body = collect_stream(second).await;
    assert_eq!(first_body, second_body);
}
