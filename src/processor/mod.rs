use crate::cache::{CacheBuffer, CacheKey};
use crate::config::FederationConfig;
use crate::drain::Drain;
use crate::error::FederatorError;
use crate::routing::{demux_routes, group_routes_by_network, Level, Route, Selection};
use crate::server::AppContext;
use crate::splitter::enforce_limits;
use crate::worker::{
    Job, JsonWorker, MiniSeedWorker, RequestMethod, StationXmlWorker, TextWorker, UpstreamStats,
    Worker, WorkerEnv,
};
use crate::worker::station_xml::DOCUMENT_FOOTER;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Response format of a federated service, selecting the worker variant,
/// the drain ordering, and the stream envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
    StationXml { level: Level },
    MiniSeed,
}

impl ResponseFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseFormat::Text => "text/plain",
            ResponseFormat::Json => "application/json",
            ResponseFormat::StationXml { .. } => "application/xml",
            ResponseFormat::MiniSeed => "application/vnd.fdsn.mseed",
        }
    }

    /// Binary time series reassemble in route order; everything else is
    /// first-come under the drain lock.
    fn ordered(&self) -> bool {
        matches!(self, ResponseFormat::MiniSeed)
    }

    fn footer(&self) -> Option<Bytes> {
        match self {
            ResponseFormat::Json => Some(Bytes::from_static(b"]")),
            ResponseFormat::StationXml { .. } => Some(Bytes::from_static(DOCUMENT_FOOTER)),
            _ => None,
        }
    }

    fn make_worker(&self, fed: &FederationConfig) -> Worker {
        match self {
            ResponseFormat::Text => Worker::Text(TextWorker),
            ResponseFormat::Json => Worker::Json(JsonWorker {
                split_duration: fed.split_duration,
                rescan_window: fed.rescan_window,
            }),
            ResponseFormat::StationXml { level } => {
                Worker::StationXml(StationXmlWorker { level: *level })
            }
            ResponseFormat::MiniSeed => Worker::MiniSeed(MiniSeedWorker),
        }
    }
}

/// A validated federated request, produced by ingress parsing.
#[derive(Debug, Clone)]
pub struct FedRequest {
    /// Service id: `dataselect`, `station`, `availability`, `wfcatalog`.
    pub service: String,
    pub format: ResponseFormat,
    pub selection: Selection,
    /// Format and filter parameters forwarded to endpoint requests.
    pub extra_params: Vec<(String, String)>,
    /// Empty-result status elected by the client (204 or 404).
    pub nodata: u16,
}

/// What the HTTP layer streams back on success.
#[derive(Debug)]
pub enum ProcessedResponse {
    /// Cache hit — the complete body, byte-identical to the committed miss.
    Cached(Bytes),
    /// Live federation — chunks arrive as workers produce them. The 200
    /// status is already committed by construction (first byte exists).
    Stream(mpsc::Receiver<Bytes>),
}

/// Federating request processor: resolves routes, enforces limits, runs the
/// worker pool over the dispatch queue, and manages the response lifecycle
/// (lazy preparation, footer, atomic cache commit, cancellation).
pub struct RequestProcessor {
    ctx: AppContext,
}

impl RequestProcessor {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, req: FedRequest) -> Result<ProcessedResponse, FederatorError> {
        let fed = self.ctx.config.federation_for(&req.service);

        // Resolution — an empty table is "no data", no endpoint is contacted.
        let routes = self.ctx.resolver.resolve(&req.selection).await?;
        if routes.is_empty() {
            debug!(service = %req.service, "processor: routing returned no routes");
            return Err(FederatorError::NoData);
        }
        info!(
            service = %req.service,
            routes = routes.len(),
            "processor: resolved"
        );

        // Limits — fatal before any byte is written.
        enforce_limits(&routes, &fed)?;

        // Cache lookup.
        let cache_key = cache_key_for(&req);
        if let Some(store) = &self.ctx.cache {
            if let Some(body) = store.get(&cache_key) {
                metrics::counter!("federator_cache_total", "result" => "hit").increment(1);
                return Ok(ProcessedResponse::Cached(body));
            }
            metrics::counter!("federator_cache_total", "result" => "miss").increment(1);
        }

        let jobs = build_jobs(&req.format, routes);
        let pool_size = fed
            .pool_size
            .min(jobs.len())
            .min(self.ctx.config.endpoint.connection_limit)
            .max(1);

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let cache_buffer = self
            .ctx
            .cache
            .as_ref()
            .map(|_| CacheBuffer::new(cache_key.clone()));
        let drain = if req.format.ordered() {
            Drain::ordered(tx, fed.drain_buffer_bytes, cache_buffer)
        } else {
            Drain::unordered(tx, cache_buffer)
        };

        let cancel = CancellationToken::new();
        let stats = Arc::new(UpstreamStats::default());
        let env = WorkerEnv {
            client: self.ctx.endpoint_client.clone(),
            method: RequestMethod::from_config(&self.ctx.config.endpoint.request_method),
            extra_params: req.extra_params.clone(),
            budget: self.ctx.budget.clone(),
            drain: drain.clone(),
            cancel: cancel.clone(),
            stats: stats.clone(),
        };

        let worker = Arc::new(req.format.make_worker(&fed));
        let jobs = Arc::new(jobs);
        let next_job = Arc::new(AtomicUsize::new(0));

        let mut pool = JoinSet::new();
        for _ in 0..pool_size {
            pool.spawn(run_jobs(
                worker.clone(),
                env.clone(),
                jobs.clone(),
                next_job.clone(),
            ));
        }
        debug!(
            service = %req.service,
            jobs = jobs.len(),
            pool_size,
            "processor: dispatched"
        );

        // Completion drives the pool to the end, writes the footer, and
        // commits or discards the cache buffer. It keeps running after the
        // response has been handed to the HTTP layer.
        let footer = req.format.footer();
        let streaming_timeout = Duration::from_secs(fed.streaming_timeout);
        let completion_drain = drain.clone();
        let cache_store = self.ctx.cache.clone();
        let service = req.service.clone();
        let mut completion = tokio::spawn(async move {
            let result = supervise(pool, &cancel, streaming_timeout).await;
            match result {
                Ok(()) => {
                    if completion_drain.bytes_written() > 0 {
                        if let Some(footer) = footer {
                            let _ = completion_drain.write_tail(footer).await;
                        }
                        if let (Some(store), Some(buffer)) =
                            (&cache_store, completion_drain.take_cache_buffer())
                        {
                            buffer.commit(store.as_ref());
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    // Never publish a partial response.
                    drop(completion_drain.take_cache_buffer());
                    Err(e)
                }
            }
        });

        // Lazy preparation: commit the 200 only once a worker has produced
        // output. If the pool drains first without a byte, fail cleanly.
        let finished_first = tokio::select! {
            finished = &mut completion => Some(finished),
            _ = drain.first_byte() => None,
        };

        match finished_first {
            None => {
                drop(drain);
                tokio::spawn(async move {
                    if let Ok(Err(e)) = completion.await {
                        // The status is already on the wire — terminate the
                        // stream and log.
                        error!(service = %service, error = %e, "processor: stream terminated");
                    }
                });
                Ok(ProcessedResponse::Stream(rx))
            }
            // Output exists even though completion won the race — stream the
            // buffered chunks.
            Some(Ok(Ok(()))) if drain.bytes_written() > 0 => {
                drop(drain);
                Ok(ProcessedResponse::Stream(rx))
            }
            // Every endpoint of the selection failed or was cut off — a
            // total outage, not an empty result.
            Some(Ok(Ok(()))) if stats.total_outage() => Err(FederatorError::UpstreamUnavailable),
            Some(Ok(Ok(()))) => Err(FederatorError::NoData),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(join_err)) => Err(FederatorError::Internal(join_err.to_string())),
        }
    }
}

fn cache_key_for(req: &FedRequest) -> CacheKey {
    let mut params: Vec<(String, String)> = req.extra_params.clone();
    // The format discriminant covers the station level as well.
    params.push(("format".into(), format!("{:?}", req.format)));
    CacheKey::new(&req.service, &params, &req.selection.stream_epochs)
}

/// One job per route, except StationXML where all routes of a network form
/// one job (after demultiplexing the per-URL routes to per-epoch routes).
fn build_jobs(format: &ResponseFormat, routes: Vec<Route>) -> Vec<Job> {
    match format {
        ResponseFormat::StationXml { .. } => {
            let mut table = BTreeMap::new();
            for route in routes {
                table.insert(route.url.clone(), route.stream_epochs);
            }
            group_routes_by_network(demux_routes(&table))
                .into_iter()
                .map(|(network, routes)| Job::NetworkGroup { network, routes })
                .collect()
        }
        _ => routes
            .into_iter()
            .enumerate()
            .map(|(index, route)| Job::Route { index, route })
            .collect(),
    }
}

/// Pull jobs off the shared queue until it is empty or the request dies.
async fn run_jobs(
    worker: Arc<Worker>,
    env: WorkerEnv,
    jobs: Arc<Vec<Job>>,
    next: Arc<AtomicUsize>,
) -> Result<(), FederatorError> {
    loop {
        if env.cancel.is_cancelled() {
            return Err(FederatorError::Cancelled);
        }
        let i = next.fetch_add(1, Ordering::Relaxed);
        if i >= jobs.len() {
            return Ok(());
        }
        worker.run_job(&env, &jobs[i]).await?;
    }
}

/// Wait for every worker. The first fatal error cancels the rest
/// (structured: token first, hard abort on timeout); the streaming timeout
/// bounds the whole federated response.
async fn supervise(
    mut pool: JoinSet<Result<(), FederatorError>>,
    cancel: &CancellationToken,
    streaming_timeout: Duration,
) -> Result<(), FederatorError> {
    let deadline = tokio::time::sleep(streaming_timeout);
    tokio::pin!(deadline);
    let mut deadline_fired = false;

    let mut fatal: Option<FederatorError> = None;
    loop {
        tokio::select! {
            joined = pool.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    if fatal.is_none() {
                        cancel.cancel();
                        fatal = Some(e);
                    }
                }
                Some(Err(join_err)) => {
                    if fatal.is_none() && !join_err.is_cancelled() {
                        cancel.cancel();
                        fatal = Some(FederatorError::Internal(join_err.to_string()));
                    }
                }
            },
            _ = &mut deadline, if !deadline_fired => {
                deadline_fired = true;
                if fatal.is_none() {
                    fatal = Some(FederatorError::Cancelled);
                }
                cancel.cancel();
                pool.abort_all();
            }
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
