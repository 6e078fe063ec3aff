use crate::drain::DrainClosed;
use crate::error::FederatorError;
use crate::splitter::split_epoch;
use crate::worker::{fetch_epoch, read_body, FetchResult, Job, WorkerEnv};
use bytes::Bytes;
use tracing::warn;

/// Split-align worker for JSON-array formats (WFCatalog).
///
/// A route's epoch is subdivided into contiguous chunks fetched
/// sequentially; adjacent responses repeat the overlap exactly, so before a
/// response is appended the last object already buffered is compared with
/// the response's first object and the duplicate is dropped. The buffer
/// holds comma-separated serialized objects without the outer brackets; the
/// opening `[` is written once per request and the processor appends the
/// closing `]`.
pub struct JsonWorker {
    /// Chunk length for sub-requests, in days.
    pub split_duration: u32,
    /// Backwards-scan bound for recovering the buffered tail object.
    pub rescan_window: usize,
}

impl JsonWorker {
    pub async fn run_job(&self, env: &WorkerEnv, job: &Job) -> Result<(), FederatorError> {
        let Job::Route { route, .. } = job else {
            return Err(FederatorError::Internal(
                "json worker dispatched a grouped job".to_string(),
            ));
        };

        let mut buf: Vec<u8> = Vec::new();
        for epoch in &route.stream_epochs {
            for chunk in split_epoch(epoch, self.split_duration) {
                let body = match fetch_epoch(env, &route.url, &chunk).await? {
                    FetchResult::Payload(resp) => match read_body(env, &route.url, resp).await? {
                        Some(body) => body,
                        None => continue,
                    },
                    FetchResult::NoContent => continue,
                };
                if let Err(e) = merge_response(&mut buf, &body, self.rescan_window) {
                    match e {
                        MergeError::Malformed => {
                            warn!(
                                endpoint = %route.url,
                                "worker: malformed json response, dropping"
                            );
                        }
                        MergeError::TailScanExhausted => {
                            return Err(FederatorError::Internal(
                                "json tail object exceeds the rescan window".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        if buf.is_empty() {
            return Ok(());
        }
        let guard = env.drain.lock().await;
        let opened = guard
            .write_once(Bytes::from_static(b"["))
            .await
            .map_err(drain_closed)?;
        if !opened {
            guard
                .write(Bytes::from_static(b","))
                .await
                .map_err(drain_closed)?;
        }
        guard.write(Bytes::from(buf)).await.map_err(drain_closed)?;
        Ok(())
    }
}

fn drain_closed(_: DrainClosed) -> FederatorError {
    FederatorError::Cancelled
}

#[derive(Debug, PartialEq, Eq)]
enum MergeError {
    /// The response is not a JSON array — treated as no-content.
    Malformed,
    /// The buffered tail object could not be recovered within the window.
    TailScanExhausted,
}

/// Align `body` (a serialized JSON array) against the buffered objects and
/// append it, dropping the overlap duplicate at the boundary.
fn merge_response(buf: &mut Vec<u8>, body: &[u8], window: usize) -> Result<(), MergeError> {
    let inner = strip_array(body).ok_or(MergeError::Malformed)?;
    if inner.is_empty() {
        return Ok(());
    }

    if buf.is_empty() {
        buf.extend_from_slice(inner);
        return Ok(());
    }

    let tail = last_object_span(buf, window).ok_or(MergeError::TailScanExhausted)?;
    let tail_obj: serde_json::Value =
        serde_json::from_slice(tail).map_err(|_| MergeError::TailScanExhausted)?;

    let (head_start, head_end) = first_object_span(inner).ok_or(MergeError::Malformed)?;
    let head_obj: serde_json::Value =
        serde_json::from_slice(&inner[head_start..head_end]).map_err(|_| MergeError::Malformed)?;

    let rest = if tail_obj == head_obj {
        // Drop the duplicated head object and its trailing separator.
        let mut rest = &inner[head_end..];
        rest = trim_ascii(rest);
        rest = rest.strip_prefix(b",").unwrap_or(rest);
        trim_ascii(rest)
    } else {
        inner
    };

    if rest.is_empty() {
        return Ok(());
    }
    buf.push(b',');
    buf.extend_from_slice(rest);
    Ok(())
}

/// Content between the outer `[` and `]`, trimmed. `None` when the body is
/// not an array.
fn strip_array(body: &[u8]) -> Option<&[u8]> {
    let trimmed = trim_ascii(body);
    let inner = trimmed.strip_prefix(b"[")?.strip_suffix(b"]")?;
    Some(trim_ascii(inner))
}

/// Span of the first serialized object, located by forward brace balancing.
/// The upstream serialization is canonical — brace bytes inside strings are
/// not expected.
fn first_object_span(inner: &[u8]) -> Option<(usize, usize)> {
    let start = inner.iter().position(|&b| b == b'{')?;
    let mut depth = 0usize;
    for (i, &b) in inner.iter().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover the last complete object in `buf` by scanning backwards and
/// balancing braces. The scan is bounded by `window` bytes; `None` means the
/// bound was exhausted before the object balanced.
fn last_object_span(buf: &[u8], window: usize) -> Option<&[u8]> {
    let mut depth = 0usize;
    let mut seen_close = false;
    for (scanned, (i, &b)) in buf.iter().enumerate().rev().enumerate() {
        if scanned >= window {
            return None;
        }
        match b {
            b'}' => {
                depth += 1;
                seen_close = true;
            }
            b'{' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 && seen_close {
                    return Some(&buf[i..]);
                }
            }
            _ => {}
        }
    }
    None
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}
