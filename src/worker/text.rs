use crate::drain::DrainClosed;
use crate::error::FederatorError;
use crate::worker::{fetch_epoch, read_body, FetchResult, Job, WorkerEnv};
use bytes::Bytes;

/// Header prefix of line-oriented FDSN text formats.
const HEADER_PREFIX: u8 = b'#';

/// Worker for newline-delimited text formats (station text, availability
/// text). Responses open with a header line; the first header observed for
/// the request is kept, every later one is dropped, and the remaining
/// records stream through unchanged.
pub struct TextWorker;

impl TextWorker {
    pub async fn run_job(&self, env: &WorkerEnv, job: &Job) -> Result<(), FederatorError> {
        let Job::Route { route, .. } = job else {
            return Err(FederatorError::Internal(
                "text worker dispatched a grouped job".to_string(),
            ));
        };

        for epoch in &route.stream_epochs {
            let body = match fetch_epoch(env, &route.url, epoch).await? {
                FetchResult::Payload(resp) => match read_body(env, &route.url, resp).await? {
                    Some(body) => body,
                    None => continue,
                },
                FetchResult::NoContent => continue,
            };
            if body.is_empty() {
                continue;
            }

            let (header, records) = split_header(&body);
            let guard = env.drain.lock().await;
            if let Some(header) = header {
                guard
                    .write_once(Bytes::copy_from_slice(header))
                    .await
                    .map_err(drain_closed)?;
            }
            guard
                .write(Bytes::copy_from_slice(records))
                .await
                .map_err(drain_closed)?;
        }
        Ok(())
    }
}

fn drain_closed(_: DrainClosed) -> FederatorError {
    FederatorError::Cancelled
}

/// Split a response body into its header line (detected by content prefix,
/// newline included) and the remaining records. Responses without a header
/// pass through whole.
fn split_header(body: &[u8]) -> (Option<&[u8]>, &[u8]) {
    if body.first() != Some(&HEADER_PREFIX) {
        return (None, body);
    }
    match body.iter().position(|&b| b == b'\n') {
        Some(nl) => (Some(&body[..=nl]), &body[nl + 1..]),
        // A header with no terminating newline carries no records.
        None => (Some(body), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_header_present() {
        let body = b"#Network|Station|Latitude\nCH|HASLI|46.8\nCH|DAVOX|46.7\n";
        let (header, records) = split_header(body);
        assert_eq!(header.unwrap(), b"#Network|Station|Latitude\n");
        assert_eq!(records, b"CH|HASLI|46.8\nCH|DAVOX|46.7\n");
    }

    #[test]
    fn test_split_header_absent() {
        let body = b"CH|HASLI|46.8\n";
        let (header, records) = split_header(body);
        assert!(header.is_none());
        assert_eq!(records, body);
    }

    #[test]
    fn test_split_header_only() {
        let (header, records) = split_header(b"#Network|Station");
        assert_eq!(header.unwrap(), b"#Network|Station");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_header_written_once_across_responses() {
        use crate::drain::Drain;
        use tokio::sync::mpsc;

        let (tx, mut rx) = mpsc::channel(16);
        let drain = Drain::unordered(tx, None);

        for body in [
            b"#Network|Station\nCH|HASLI\n".as_slice(),
            b"#Network|Station\nGR|BFO\n".as_slice(),
        ] {
            let (header, records) = split_header(body);
            let guard = drain.lock().await;
            if let Some(header) = header {
                guard
                    .write_once(Bytes::copy_from_slice(header))
                    .await
                    .unwrap();
            }
            guard.write(Bytes::copy_from_slice(records)).await.unwrap();
        }
        drop(drain);

        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"#Network|Station\nCH|HASLI\nGR|BFO\n");
    }
}
