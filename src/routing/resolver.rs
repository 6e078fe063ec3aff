use crate::config::RoutingConfig;
use crate::error::FederatorError;
use crate::routing::{parser, Route, RoutingTable};
use crate::sncl::{merge_epochs, Stream, StreamEpoch};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Granularity of a station-service selection. Services without a level
/// semantics use `Channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Network,
    Station,
    Channel,
    Response,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Network => "network",
            Level::Station => "station",
            Level::Channel => "channel",
            Level::Response => "response",
        }
    }

    /// Whether per-channel epochs collapse to `(net, sta)` granularity.
    pub fn collapses(&self) -> bool {
        matches!(self, Level::Network | Level::Station)
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Level::Network),
            "station" => Ok(Level::Station),
            "channel" => Ok(Level::Channel),
            "response" => Ok(Level::Response),
            other => Err(format!("invalid level: {:?}", other)),
        }
    }
}

/// Geographic constraint forwarded to the routing service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// A validated selection, ready for route resolution.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Routing service id (`dataselect`, `station`, `availability`,
    /// `wfcatalog`).
    pub service: String,
    pub level: Level,
    pub access: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub stream_epochs: Vec<StreamEpoch>,
}

/// Translates a selection into routes by consulting the external routing
/// service, then normalizes the reply: clip to the requested interval, merge
/// overlapping or abutting epochs per URL, collapse granularity per level,
/// sort.
///
/// Virtual-network expansion happens inside the routing service; this client
/// only ever sees concrete `(net, sta, loc, cha)` tuples.
#[derive(Clone)]
pub struct RouteResolver {
    client: reqwest::Client,
    url: String,
}

impl RouteResolver {
    pub fn new(cfg: &RoutingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout))
            .pool_max_idle_per_host(cfg.connection_limit)
            .build()?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
        })
    }

    /// Resolve `selection` into a sorted route list. An empty list means
    /// "no data" — the caller must not contact any endpoint.
    pub async fn resolve(&self, selection: &Selection) -> Result<Vec<Route>, FederatorError> {
        let body = routing_request_body(selection);
        debug!(url = %self.url, service = %selection.service, "routing: request");

        let resp = self
            .client
            .post(&self.url)
            .header("content-type", "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!("routing: transport error: {}", e);
                FederatorError::RoutingUnavailable(e.to_string())
            })?;

        let status = resp.status();
        metrics::counter!(
            "federator_routing_requests_total",
            "status_code" => status.as_u16().to_string(),
        )
        .increment(1);

        if status.as_u16() == 204 {
            return Ok(Vec::new());
        }
        if status.is_server_error() {
            return Err(FederatorError::RoutingUnavailable(format!(
                "routing service replied {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(FederatorError::Internal(format!(
                "unexpected routing status {}",
                status
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| FederatorError::RoutingUnavailable(e.to_string()))?;
        let table = parser::parse_routing_response(&text)?;
        Ok(normalize(table, selection))
    }
}

/// Serialize the selection as a routing POST body: parameter lines followed
/// by one stream-epoch line per requested epoch.
fn routing_request_body(selection: &Selection) -> String {
    let mut body = String::new();
    body.push_str(&format!("service={}\n", selection.service));
    body.push_str(&format!("level={}\n", selection.level.as_str()));
    body.push_str("format=post\n");
    if let Some(ref access) = selection.access {
        body.push_str(&format!("access={}\n", access));
    }
    if let Some(bbox) = selection.bounding_box {
        body.push_str(&format!("minlatitude={}\n", bbox.min_latitude));
        body.push_str(&format!("maxlatitude={}\n", bbox.max_latitude));
        body.push_str(&format!("minlongitude={}\n", bbox.min_longitude));
        body.push_str(&format!("maxlongitude={}\n", bbox.max_longitude));
    }
    for epoch in &selection.stream_epochs {
        body.push_str(&epoch.to_post_line());
        body.push('\n');
    }
    body
}

/// Normalize a routing table into the final route list: clip, merge,
/// collapse, sort.
pub(crate) fn normalize(table: RoutingTable, selection: &Selection) -> Vec<Route> {
    let (lower, upper) = requested_envelope(&selection.stream_epochs);

    let mut routes: Vec<Route> = table
        .into_iter()
        .filter_map(|(url, epochs)| {
            let clipped: Vec<StreamEpoch> = epochs
                .into_iter()
                .filter_map(|se| se.clip(lower, upper))
                .collect();
            if clipped.is_empty() {
                return None;
            }
            let mut merged = merge_epochs(clipped);
            if selection.level.collapses() {
                merged = collapse_to_stations(merged);
            }
            Some(Route {
                url,
                stream_epochs: merged,
            })
        })
        .collect();

    routes.sort_by(|a, b| {
        a.url
            .cmp(&b.url)
            .then_with(|| a.stream_epochs.cmp(&b.stream_epochs))
    });
    routes
}

/// The time envelope of the requested epochs. An open bound anywhere makes
/// that side of the envelope open.
fn requested_envelope(
    epochs: &[StreamEpoch],
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut lower: Option<DateTime<Utc>> = None;
    let mut upper: Option<DateTime<Utc>> = None;
    let mut lower_open = false;
    let mut upper_open = false;
    for se in epochs {
        match se.start {
            Some(s) => lower = Some(lower.map_or(s, |l: DateTime<Utc>| l.min(s))),
            None => lower_open = true,
        }
        match se.end {
            Some(e) => upper = Some(upper.map_or(e, |u: DateTime<Utc>| u.max(e))),
            None => upper_open = true,
        }
    }
    (
        if lower_open { None } else { lower },
        if upper_open { None } else { upper },
    )
}

/// Collapse per-channel epochs into one epoch per `(net, sta)` whose
/// interval is the union of the parts.
fn collapse_to_stations(epochs: Vec<StreamEpoch>) -> Vec<StreamEpoch> {
    let mut collapsed: Vec<StreamEpoch> = Vec::new();
    for se in epochs {
        let key = (se.stream.network.clone(), se.stream.station.clone());
        match collapsed.iter_mut().find(|c| {
            (c.stream.network.as_str(), c.stream.station.as_str())
                == (key.0.as_str(), key.1.as_str())
        }) {
            Some(existing) => {
                existing.start = match (existing.start, se.start) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    _ => None,
                };
                existing.end = match (existing.end, se.end) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
            None => collapsed.push(StreamEpoch {
                stream: Stream::new(&se.stream.network, &se.stream.station, "*", "*"),
                start: se.start,
                end: se.end,
            }),
        }
    }
    collapsed.sort();
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::parse_time;

    fn epoch(net: &str, sta: &str, cha: &str, start: &str, end: &str) -> StreamEpoch {
        StreamEpoch::new(
            Stream::new(net, sta, "", cha),
            Some(parse_time(start).unwrap()),
            Some(parse_time(end).unwrap()),
        )
        .unwrap()
    }

    fn selection(level: Level, epochs: Vec<StreamEpoch>) -> Selection {
        Selection {
            service: "station".into(),
            level,
            access: None,
            bounding_box: None,
            stream_epochs: epochs,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let sel = selection(
            Level::Channel,
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-05")],
        );
        let body = routing_request_body(&sel);
        assert!(body.starts_with("service=station\nlevel=channel\nformat=post\n"));
        assert!(body.ends_with("CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00\n"));
    }

    #[test]
    fn test_normalize_clips_to_request() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://eida.ethz.ch/q".into(),
            vec![epoch("CH", "HASLI", "HHZ", "2018-01-01", "2020-01-01")],
        );
        let sel = selection(
            Level::Channel,
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-02-01")],
        );
        let routes = normalize(table, &sel);
        assert_eq!(routes.len(), 1);
        let se = &routes[0].stream_epochs[0];
        assert_eq!(se.start, Some(parse_time("2019-01-01").unwrap()));
        assert_eq!(se.end, Some(parse_time("2019-02-01").unwrap()));
    }

    #[test]
    fn test_normalize_drops_empty_after_clip() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://eida.ethz.ch/q".into(),
            vec![epoch("CH", "HASLI", "HHZ", "2010-01-01", "2011-01-01")],
        );
        let sel = selection(
            Level::Channel,
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-02-01")],
        );
        assert!(normalize(table, &sel).is_empty());
    }

    #[test]
    fn test_normalize_merges_same_url() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://eida.ethz.ch/q".into(),
            vec![
                epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-10"),
                epoch("CH", "HASLI", "HHZ", "2019-01-10", "2019-01-20"),
            ],
        );
        let sel = selection(
            Level::Channel,
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-02-01")],
        );
        let routes = normalize(table, &sel);
        assert_eq!(routes[0].stream_epochs.len(), 1);
    }

    #[test]
    fn test_normalize_collapses_station_level() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://eida.ethz.ch/q".into(),
            vec![
                epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-10"),
                epoch("CH", "HASLI", "HHN", "2019-01-05", "2019-01-20"),
                epoch("CH", "DAVOX", "HHZ", "2019-01-01", "2019-01-10"),
            ],
        );
        let sel = selection(
            Level::Station,
            vec![epoch("CH", "*", "*", "2019-01-01", "2019-02-01")],
        );
        let routes = normalize(table, &sel);
        let epochs = &routes[0].stream_epochs;
        assert_eq!(epochs.len(), 2);
        let hasli = epochs.iter().find(|e| e.stream.station == "HASLI").unwrap();
        assert_eq!(hasli.stream.channel, "*");
        assert_eq!(hasli.start, Some(parse_time("2019-01-01").unwrap()));
        assert_eq!(hasli.end, Some(parse_time("2019-01-20").unwrap()));
    }

    #[test]
    fn test_normalize_sorted_by_url() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://z.example.org/q".into(),
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-02")],
        );
        table.insert(
            "http://a.example.org/q".into(),
            vec![epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-02")],
        );
        let sel = selection(
            Level::Channel,
            vec![epoch("CH", "*", "HHZ", "2019-01-01", "2019-01-05")],
        );
        let routes = normalize(table, &sel);
        assert_eq!(routes[0].url, "http://a.example.org/q");
        assert_eq!(routes[1].url, "http://z.example.org/q");
    }
}
