pub mod json;
pub mod miniseed;
pub mod station_xml;
pub mod text;

pub use json::JsonWorker;
pub use miniseed::MiniSeedWorker;
pub use station_xml::StationXmlWorker;
pub use text::TextWorker;

use crate::budget::{RetryBudget, UpstreamOutcome};
use crate::drain::Drain;
use crate::error::FederatorError;
use crate::routing::Route;
use crate::sncl::{format_time, StreamEpoch};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP method used towards data endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

impl RequestMethod {
    pub fn from_config(s: &str) -> Self {
        if s.eq_ignore_ascii_case("post") {
            RequestMethod::Post
        } else {
            RequestMethod::Get
        }
    }
}

/// Everything a worker needs besides its job: the pooled endpoint client,
/// the drain, the retry budget, and the request-scoped cancellation token.
/// Explicit dependencies — workers own no global state.
#[derive(Clone)]
pub struct WorkerEnv {
    pub client: reqwest::Client,
    pub method: RequestMethod,
    /// Format and filter parameters forwarded to every endpoint request.
    pub extra_params: Vec<(String, String)>,
    pub budget: Arc<RetryBudget>,
    pub drain: Drain,
    pub cancel: CancellationToken,
    /// Request-wide fetch accounting, read by the processor to distinguish
    /// "no data" from a total upstream outage.
    pub stats: Arc<UpstreamStats>,
}

/// Counts of reachable vs failed endpoint fetches across the request.
#[derive(Default)]
pub struct UpstreamStats {
    reachable: std::sync::atomic::AtomicUsize,
    failed: std::sync::atomic::AtomicUsize,
}

impl UpstreamStats {
    fn mark_reachable(&self) {
        self.reachable
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn mark_failed(&self) {
        self.failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// True when at least one fetch failed and none succeeded — every
    /// endpoint of the selection is down or cut off.
    pub fn total_outage(&self) -> bool {
        self.reachable.load(std::sync::atomic::Ordering::Relaxed) == 0
            && self.failed.load(std::sync::atomic::Ordering::Relaxed) > 0
    }
}

/// The unit placed on the dispatch queue. Most formats dispatch one route
/// per job; StationXML groups all routes of one network so that
/// network-level merging happens inside a single worker.
#[derive(Debug, Clone)]
pub enum Job {
    Route { index: usize, route: Route },
    NetworkGroup { network: String, routes: Vec<Route> },
}

/// Format-specific merging worker. One variant per response format; the
/// processor selects the variant from the service id.
pub enum Worker {
    Text(TextWorker),
    Json(JsonWorker),
    StationXml(StationXmlWorker),
    MiniSeed(MiniSeedWorker),
}

impl Worker {
    pub async fn run_job(&self, env: &WorkerEnv, job: &Job) -> Result<(), FederatorError> {
        match self {
            Worker::Text(w) => w.run_job(env, job).await,
            Worker::Json(w) => w.run_job(env, job).await,
            Worker::StationXml(w) => w.run_job(env, job).await,
            Worker::MiniSeed(w) => w.run_job(env, job).await,
        }
    }
}

/// Outcome of one endpoint fetch after budget accounting and status
/// classification.
pub enum FetchResult {
    /// 200 — the streamed body is ready for consumption.
    Payload(reqwest::Response),
    /// 204/404, a budget cutoff, or an absorbed per-route failure.
    NoContent,
}

/// Fetch one stream epoch from `url`.
///
/// Applies the budget cutoff, sends GET or POST per configuration, records
/// the outcome, and classifies the status: 200 consume; 204/404 silent
/// no-data; 413 fatal for the whole request; anything else absorbed into
/// no-data for this route.
pub async fn fetch_epoch(
    env: &WorkerEnv,
    url: &str,
    epoch: &StreamEpoch,
) -> Result<FetchResult, FederatorError> {
    if env.budget.should_cut(url) {
        env.stats.mark_failed();
        return Ok(FetchResult::NoContent);
    }

    let request = match env.method {
        RequestMethod::Get => {
            let mut params: Vec<(String, String)> = vec![
                ("network".into(), epoch.stream.network.clone()),
                ("station".into(), epoch.stream.station.clone()),
                ("location".into(), epoch.stream.wire_location().to_string()),
                ("channel".into(), epoch.stream.channel.clone()),
            ];
            if let Some(start) = epoch.start {
                params.push(("starttime".into(), format_time(start)));
            }
            if let Some(end) = epoch.end {
                params.push(("endtime".into(), format_time(end)));
            }
            params.extend(env.extra_params.iter().cloned());
            env.client.get(url).query(&params)
        }
        RequestMethod::Post => {
            let mut body = String::new();
            for (k, v) in &env.extra_params {
                body.push_str(&format!("{}={}\n", k, v));
            }
            body.push_str(&epoch.to_post_line());
            body.push('\n');
            env.client
                .post(url)
                .header("content-type", "text/plain")
                .body(body)
        }
    };

    let send = request.send();
    let resp = tokio::select! {
        resp = send => resp,
        _ = env.cancel.cancelled() => return Err(FederatorError::Cancelled),
    };

    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            warn!(endpoint = url, error = %e, "worker: endpoint request failed");
            env.budget.record(url, UpstreamOutcome::Failure);
            env.stats.mark_failed();
            return Ok(FetchResult::NoContent);
        }
    };

    let status = resp.status().as_u16();
    metrics::counter!(
        "federator_endpoint_requests_total",
        "endpoint" => url.to_string(),
        "status_code" => status.to_string(),
    )
    .increment(1);

    if let Some(outcome) = UpstreamOutcome::from_status(status) {
        env.budget.record(url, outcome);
    }

    match status {
        200 => {
            env.stats.mark_reachable();
            Ok(FetchResult::Payload(resp))
        }
        204 | 404 => {
            debug!(endpoint = url, status, "worker: no content");
            env.stats.mark_reachable();
            Ok(FetchResult::NoContent)
        }
        413 => Err(FederatorError::PayloadTooLarge(format!(
            "endpoint {} rejected the request as too large",
            url
        ))),
        _ => {
            warn!(endpoint = url, status, "worker: endpoint error, dropping route");
            env.stats.mark_failed();
            Ok(FetchResult::NoContent)
        }
    }
}

/// Read a 200 response to completion. Transport errors mid-body are
/// absorbed into no-data for the route (`None`), consistent with the
/// per-route recovery rule.
pub async fn read_body(
    env: &WorkerEnv,
    url: &str,
    resp: reqwest::Response,
) -> Result<Option<Vec<u8>>, FederatorError> {
    let mut resp = resp;
    let mut body = Vec::new();
    loop {
        let chunk = tokio::select! {
            chunk = resp.chunk() => chunk,
            _ = env.cancel.cancelled() => return Err(FederatorError::Cancelled),
        };
        match chunk {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => return Ok(Some(body)),
            Err(e) => {
                warn!(endpoint = url, error = %e, "worker: body read failed");
                env.budget.record(url, UpstreamOutcome::Failure);
                return Ok(None);
            }
        }
    }
}
