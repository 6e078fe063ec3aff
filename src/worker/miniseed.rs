use crate::budget::UpstreamOutcome;
use crate::drain::DrainClosed;
use crate::error::FederatorError;
use crate::worker::{fetch_epoch, FetchResult, Job, WorkerEnv};
use tracing::warn;

/// Worker for opaque framed binary time series (miniSEED).
///
/// No decoding, no dedup — bytes stream straight through. Chunks are tagged
/// with the route index so the ordered drain reassembles the response in
/// route order while upstream reads stay concurrent across workers.
pub struct MiniSeedWorker;

impl MiniSeedWorker {
    pub async fn run_job(&self, env: &WorkerEnv, job: &Job) -> Result<(), FederatorError> {
        let Job::Route { index, route } = job else {
            return Err(FederatorError::Internal(
                "miniseed worker dispatched a grouped job".to_string(),
            ));
        };

        let result = self.stream_route(env, *index, route).await;
        // The key must be released even when the route yielded nothing,
        // otherwise every later route stalls behind the gap.
        env.drain
            .finish_key(*index)
            .await
            .map_err(|_: DrainClosed| FederatorError::Cancelled)?;
        result
    }

    async fn stream_route(
        &self,
        env: &WorkerEnv,
        index: usize,
        route: &crate::routing::Route,
    ) -> Result<(), FederatorError> {
        for epoch in &route.stream_epochs {
            let mut resp = match fetch_epoch(env, &route.url, epoch).await? {
                FetchResult::Payload(resp) => resp,
                FetchResult::NoContent => continue,
            };

            loop {
                let chunk = tokio::select! {
                    chunk = resp.chunk() => chunk,
                    _ = env.cancel.cancelled() => return Err(FederatorError::Cancelled),
                };
                match chunk {
                    Ok(Some(chunk)) => {
                        env.drain
                            .write_keyed(index, chunk)
                            .await
                            .map_err(|_: DrainClosed| FederatorError::Cancelled)?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Mid-body failure: the route's already-emitted bytes
                        // stand, the remainder is dropped.
                        warn!(endpoint = %route.url, error = %e, "worker: body read failed");
                        env.budget.record(&route.url, UpstreamOutcome::Failure);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
