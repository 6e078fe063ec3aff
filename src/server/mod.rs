mod admin;
pub mod bootstrap;
pub mod query;
mod state;

pub use state::AppContext;

use crate::error::FederatorError;
use crate::processor::{FedRequest, ProcessedResponse, RequestProcessor, ResponseFormat};
use crate::sncl::format_time;
use anyhow::Result;
use bytes::Bytes;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, ORIGIN};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Run the federating gateway server with graceful shutdown.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete.
pub async fn run_server(listen: &str, ctx: AppContext, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("federator_connections_total", "status" => "accepted")
                    .increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!("federator_connections_total", "status" => "error")
                    .increment(1);
                continue;
            }
        };

        metrics::gauge!("federator_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let ctx = ctx.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let ctx_inner = ctx.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx_inner.clone();
                async move { handle_request(req, ctx).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("federator_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase.
    let drain = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        info!(
            "server: drain timeout, {} connections still active",
            active_conns.load(Ordering::Relaxed)
        );
    }
    Ok(())
}

/// Run the admin listener for health checks and metrics.
pub async fn run_admin_server(listen: &str, ctx: AppContext) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx.clone();
                async move { admin::handle_admin(req, ctx) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

/// Handle one client request: match the service, parse the selection, run
/// the federating processor, and stream the result.
async fn handle_request(
    req: Request<Incoming>,
    ctx: AppContext,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let request_line = if query.is_empty() {
        format!("{} {}", method, path)
    } else {
        format!("{} {}?{}", method, path, query)
    };
    let submitted = format_time(chrono::Utc::now());

    let Some(service) = query::match_service(&path) else {
        return Ok(plain_error(
            StatusCode::NOT_FOUND,
            &FederatorError::NoData,
            &request_line,
            &submitted,
            origin.as_deref(),
        ));
    };

    metrics::gauge!("federator_requests_in_flight", "service" => service).increment(1.0);

    let parsed = if method == Method::GET {
        query::parse_get(service, &query)
    } else if method == Method::POST {
        match read_body_limited(req, ctx.config.server.client_max_size).await? {
            Ok(body) => query::parse_post(service, &body),
            Err(too_large) => Err(too_large),
        }
    } else {
        Err(FederatorError::Validation(format!(
            "method {} is not supported on query endpoints",
            method
        )))
    };

    let response = match parsed {
        Ok(fed_req) => {
            respond(&ctx, fed_req, &request_line, &submitted, origin.as_deref()).await
        }
        Err(e) => {
            let status =
                StatusCode::from_u16(e.http_status(400)).unwrap_or(StatusCode::BAD_REQUEST);
            plain_error(status, &e, &request_line, &submitted, origin.as_deref())
        }
    };

    let status = response.status().as_u16();
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "federator_requests_total",
        "service" => service,
        "method" => method.as_str().to_string(),
        "status_code" => buf.format(status).to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "federator_request_duration_seconds",
        "service" => service,
    )
    .record(start.elapsed().as_secs_f64());
    metrics::gauge!("federator_requests_in_flight", "service" => service).decrement(1.0);

    info!(
        method = %method,
        path = %path,
        status,
        service,
        latency_ms = %start.elapsed().as_millis(),
        "access"
    );

    Ok(response)
}

async fn respond(
    ctx: &AppContext,
    fed_req: FedRequest,
    request_line: &str,
    submitted: &str,
    origin: Option<&str>,
) -> Response<BoxBody> {
    let nodata = fed_req.nodata;
    let format = fed_req.format;
    let processor = RequestProcessor::new(ctx.clone());

    match processor.process(fed_req).await {
        Ok(ProcessedResponse::Cached(body)) => {
            success_response(&format, origin, full_body(body))
        }
        Ok(ProcessedResponse::Stream(rx)) => {
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|chunk| (Ok::<_, hyper::Error>(Frame::data(chunk)), rx))
            });
            success_response(&format, origin, BodyExt::boxed(StreamBody::new(stream)))
        }
        Err(e) => {
            let status = e.http_status(nodata);
            if !matches!(e, FederatorError::NoData) {
                warn!(error = %e, "request failed");
            }
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            plain_error(status, &e, request_line, submitted, origin)
        }
    }
}

fn success_response(
    format: &ResponseFormat,
    origin: Option<&str>,
    body: BoxBody,
) -> Response<BoxBody> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, format.content_type());

    // A timestamped attachment name for download-style formats.
    let attachment_ext = match format {
        ResponseFormat::Json => Some("json"),
        ResponseFormat::MiniSeed => Some("mseed"),
        _ => None,
    };
    if let Some(ext) = attachment_ext {
        let filename = format!(
            "attachment; filename=\"seisgate-{}.{}\"",
            format_time(chrono::Utc::now()),
            ext
        );
        if let Ok(v) = HeaderValue::from_str(&filename) {
            builder = builder.header(CONTENT_DISPOSITION, v);
        }
    }

    builder = with_cors(builder, origin);
    builder.body(body).unwrap()
}

/// Build an FDSN error document response. 204 carries no body.
fn plain_error(
    status: StatusCode,
    error: &FederatorError,
    request_line: &str,
    submitted: &str,
    origin: Option<&str>,
) -> Response<BoxBody> {
    let mut builder = Response::builder().status(status);
    builder = with_cors(builder, origin);
    if status == StatusCode::NO_CONTENT {
        return builder.body(empty_body()).unwrap();
    }
    builder
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(error.fdsn_body(
            status.as_u16(),
            request_line,
            submitted,
        )))
        .unwrap()
}

/// CORS headers mirror the request origin; callers without one get `*`.
fn with_cors(
    builder: http::response::Builder,
    origin: Option<&str>,
) -> http::response::Builder {
    let allowed = origin
        .and_then(|o| HeaderValue::from_str(o).ok())
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    builder
        .header("access-control-allow-origin", allowed)
        .header("access-control-expose-headers", "*")
}

/// Read a POST body, rejecting it once it exceeds `max_size`.
async fn read_body_limited(
    req: Request<Incoming>,
    max_size: u64,
) -> Result<Result<String, FederatorError>, hyper::Error> {
    let mut body = req.into_body();
    let mut collected: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            if collected.len() as u64 + data.len() as u64 > max_size {
                return Ok(Err(FederatorError::PayloadTooLarge(format!(
                    "request body exceeds the configured limit of {} bytes",
                    max_size
                ))));
            }
            collected.extend_from_slice(data);
        }
    }
    Ok(Ok(String::from_utf8_lossy(&collected).into_owned()))
}
