use crate::config::FederationConfig;
use crate::error::FederatorError;
use crate::routing::Route;
use crate::sncl::StreamEpoch;
use chrono::Duration;

/// Enforce the per-epoch and total duration ceilings on resolved routes.
///
/// Both checks run after resolution and before dispatch; a violation is
/// fatal for the request and must surface before any response byte. An
/// open-ended epoch exceeds every finite ceiling.
pub fn enforce_limits(routes: &[Route], cfg: &FederationConfig) -> Result<(), FederatorError> {
    let per_epoch = cfg.max_stream_epoch_duration.map(days);
    let total_cap = cfg.max_total_stream_epoch_duration.map(days);

    let mut total = Duration::zero();
    for route in routes {
        for se in &route.stream_epochs {
            match se.duration() {
                Some(d) => {
                    if let Some(cap) = per_epoch {
                        if d > cap {
                            return Err(FederatorError::PayloadTooLarge(format!(
                                "stream epoch {} exceeds the per-epoch duration limit",
                                se
                            )));
                        }
                    }
                    total = total + d;
                }
                None => {
                    if per_epoch.is_some() || total_cap.is_some() {
                        return Err(FederatorError::PayloadTooLarge(format!(
                            "open-ended stream epoch {} exceeds the duration limit",
                            se
                        )));
                    }
                }
            }
        }
    }

    if let Some(cap) = total_cap {
        if total > cap {
            return Err(FederatorError::PayloadTooLarge(
                "summed stream epoch duration exceeds the total duration limit".to_string(),
            ));
        }
    }
    Ok(())
}

/// Subdivide one epoch into contiguous chunks of at most `chunk_days` days.
///
/// Coverage is preserved exactly: chunk N ends where chunk N+1 starts. The
/// chunks are consumed in order by a single worker so that overlap
/// detection across chunk boundaries stays sound. Open-ended epochs pass
/// through unsplit.
pub fn split_epoch(se: &StreamEpoch, chunk_days: u32) -> Vec<StreamEpoch> {
    let (start, end) = match (se.start, se.end) {
        (Some(s), Some(e)) => (s, e),
        _ => return vec![se.clone()],
    };
    let chunk = days(chunk_days);
    if end - start <= chunk {
        return vec![se.clone()];
    }

    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + chunk).min(end);
        chunks.push(StreamEpoch {
            stream: se.stream.clone(),
            start: Some(cursor),
            end: Some(next),
        });
        cursor = next;
    }
    chunks
}

fn days(n: u32) -> Duration {
    Duration::days(n as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::{parse_time, Stream};

    fn epoch(start: &str, end: &str) -> StreamEpoch {
        StreamEpoch::new(
            Stream::new("CH", "HASLI", "", "HHZ"),
            Some(parse_time(start).unwrap()),
            Some(parse_time(end).unwrap()),
        )
        .unwrap()
    }

    fn open_epoch() -> StreamEpoch {
        StreamEpoch::new(Stream::new("CH", "HASLI", "", "HHZ"), None, None).unwrap()
    }

    fn route(epochs: Vec<StreamEpoch>) -> Route {
        Route {
            url: "http://eida.ethz.ch/q".into(),
            stream_epochs: epochs,
        }
    }

    fn cfg(per: Option<u32>, total: Option<u32>) -> FederationConfig {
        FederationConfig {
            max_stream_epoch_duration: per,
            max_total_stream_epoch_duration: total,
            ..FederationConfig::default()
        }
    }

    #[test]
    fn test_within_limits_passes() {
        let routes = vec![route(vec![epoch("2019-01-01", "2019-01-02")])];
        enforce_limits(&routes, &cfg(Some(1), Some(2))).unwrap();
    }

    #[test]
    fn test_single_epoch_over_limit() {
        // One day plus one second.
        let routes = vec![route(vec![epoch("2019-01-01", "2019-01-02T00:00:01")])];
        let err = enforce_limits(&routes, &cfg(Some(1), None)).unwrap_err();
        assert!(matches!(err, FederatorError::PayloadTooLarge(_)));
    }

    #[test]
    fn test_total_over_limit() {
        let routes = vec![
            route(vec![epoch("2019-01-01", "2019-01-02")]),
            route(vec![epoch("2019-02-01", "2019-02-03")]),
        ];
        let err = enforce_limits(&routes, &cfg(None, Some(2))).unwrap_err();
        assert!(matches!(err, FederatorError::PayloadTooLarge(_)));
    }

    #[test]
    fn test_open_ended_exceeds_any_ceiling() {
        let routes = vec![route(vec![open_epoch()])];
        assert!(enforce_limits(&routes, &cfg(Some(365), None)).is_err());
        assert!(enforce_limits(&routes, &cfg(None, Some(365))).is_err());
        // No ceilings configured — open epochs pass.
        enforce_limits(&routes, &cfg(None, None)).unwrap();
    }

    #[test]
    fn test_split_preserves_coverage() {
        let se = epoch("2019-01-01", "2019-01-10");
        let chunks = split_epoch(&se, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start, se.start);
        assert_eq!(chunks[2].end, se.end);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_split_short_epoch_untouched() {
        let se = epoch("2019-01-01", "2019-01-02");
        assert_eq!(split_epoch(&se, 30), vec![se]);
    }

    #[test]
    fn test_split_open_epoch_untouched() {
        let se = open_epoch();
        assert_eq!(split_epoch(&se, 30), vec![se]);
    }
}
