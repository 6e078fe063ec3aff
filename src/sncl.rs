use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

/// A stream identifier: network, station, location, channel.
///
/// Wildcards (`*`, `?`) are permitted in every field; the empty location is
/// written `--` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stream {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl Stream {
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Location as transmitted in FDSN POST lines (`--` when empty).
    pub fn wire_location(&self) -> &str {
        if self.location.is_empty() {
            "--"
        } else {
            &self.location
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// A stream plus a half-open time interval `[start, end)`.
///
/// Either bound may be absent, meaning unbounded on that side. When both are
/// present, `start < end` holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEpoch {
    pub stream: Stream,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StreamEpoch {
    pub fn new(
        stream: Stream,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(format!("start {} must precede end {}", s, e));
            }
        }
        Ok(Self { stream, start, end })
    }

    /// Duration of the interval; `None` when open-ended on either side.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }

    /// Clip the interval to `[lower, upper)`. Open request bounds clip
    /// nothing on that side. Returns `None` when the clipped interval is
    /// empty or inverted.
    pub fn clip(
        &self,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Option<StreamEpoch> {
        let start = match (self.start, lower) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let end = match (self.end, upper) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return None;
            }
        }
        Some(StreamEpoch {
            stream: self.stream.clone(),
            start,
            end,
        })
    }

    /// Whether `other` covers the same stream and the intervals overlap or
    /// abut, i.e. the two can be merged into one epoch.
    pub fn mergeable(&self, other: &StreamEpoch) -> bool {
        if self.stream != other.stream {
            return false;
        }
        let starts_before_end = |s: Option<DateTime<Utc>>, e: Option<DateTime<Utc>>| match (s, e) {
            (Some(s), Some(e)) => s <= e,
            _ => true,
        };
        starts_before_end(self.start, other.end) && starts_before_end(other.start, self.end)
    }

    /// Canonical merge: the union of two overlapping or abutting intervals.
    /// Associative and commutative over mergeable epochs.
    pub fn merge(&self, other: &StreamEpoch) -> StreamEpoch {
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        StreamEpoch {
            stream: self.stream.clone(),
            start,
            end,
        }
    }

    /// Parse one FDSN POST line: `NET STA LOC CHA START END`.
    pub fn parse_line(line: &str) -> Result<StreamEpoch, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(format!("expected 6 fields, got {}: {:?}", fields.len(), line));
        }
        let location = if fields[2] == "--" { "" } else { fields[2] };
        let stream = Stream::new(fields[0], fields[1], location, fields[3]);
        let start = parse_open_time(fields[4])?;
        let end = parse_open_time(fields[5])?;
        StreamEpoch::new(stream, start, end)
    }

    /// Serialize as an FDSN POST line.
    pub fn to_post_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.stream.network,
            self.stream.station,
            self.stream.wire_location(),
            self.stream.channel,
            format_open_time(self.start),
            format_open_time(self.end),
        )
    }

    fn sort_key(&self) -> (&str, &str, &str, &str, Option<DateTime<Utc>>) {
        (
            &self.stream.network,
            &self.stream.station,
            &self.stream.location,
            &self.stream.channel,
            self.start,
        )
    }
}

impl Ord for StreamEpoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl PartialOrd for StreamEpoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {})",
            self.stream,
            format_open_time(self.start),
            format_open_time(self.end)
        )
    }
}

/// Sort epochs canonically and fold overlapping or abutting neighbours of
/// the same stream into single epochs.
pub fn merge_epochs(mut epochs: Vec<StreamEpoch>) -> Vec<StreamEpoch> {
    epochs.sort();
    let mut merged: Vec<StreamEpoch> = Vec::with_capacity(epochs.len());
    for epoch in epochs {
        match merged.last_mut() {
            Some(last) if last.mergeable(&epoch) => {
                *last = last.merge(&epoch);
            }
            _ => merged.push(epoch),
        }
    }
    merged
}

/// Parse an ISO-8601 UTC timestamp. Accepts `YYYY-MM-DD`,
/// `YYYY-MM-DDThh:mm:ss[.ffffff]`, and the same with a trailing `Z`.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(dt) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
    }
    Err(format!("invalid timestamp: {:?}", value))
}

fn parse_open_time(value: &str) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        "*" | "" | "--" => Ok(None),
        v => parse_time(v).map(Some),
    }
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn format_open_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => format_time(t),
        None => "*".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(net: &str, sta: &str, cha: &str, start: &str, end: &str) -> StreamEpoch {
        StreamEpoch::new(
            Stream::new(net, sta, "", cha),
            Some(parse_time(start).unwrap()),
            Some(parse_time(end).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_line_roundtrip() {
        let se = StreamEpoch::parse_line("CH HASLI -- HHZ 2019-01-01 2019-01-05").unwrap();
        assert_eq!(se.stream.network, "CH");
        assert_eq!(se.stream.location, "");
        assert_eq!(
            se.to_post_line(),
            "CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00"
        );
    }

    #[test]
    fn test_parse_line_rejects_inverted_interval() {
        assert!(StreamEpoch::parse_line("CH HASLI -- HHZ 2019-01-05 2019-01-01").is_err());
        assert!(StreamEpoch::parse_line("CH HASLI -- HHZ 2019-01-01").is_err());
    }

    #[test]
    fn test_parse_time_formats() {
        assert!(parse_time("2019-01-01").is_ok());
        assert!(parse_time("2019-01-01T12:30:00").is_ok());
        assert!(parse_time("2019-01-01T12:30:00.500000").is_ok());
        assert!(parse_time("2019-01-01T12:30:00Z").is_ok());
        assert!(parse_time("not-a-time").is_err());
    }

    #[test]
    fn test_clip_inside_and_outside() {
        let se = epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-02-01");
        let clipped = se
            .clip(
                Some(parse_time("2019-01-10").unwrap()),
                Some(parse_time("2019-01-20").unwrap()),
            )
            .unwrap();
        assert_eq!(clipped.start, Some(parse_time("2019-01-10").unwrap()));
        assert_eq!(clipped.end, Some(parse_time("2019-01-20").unwrap()));

        // Entirely outside the window → dropped.
        assert!(se
            .clip(
                Some(parse_time("2019-03-01").unwrap()),
                Some(parse_time("2019-04-01").unwrap()),
            )
            .is_none());
    }

    #[test]
    fn test_clip_open_bounds_pass_through() {
        let se = epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-02-01");
        let clipped = se.clip(None, None).unwrap();
        assert_eq!(clipped, se);
    }

    #[test]
    fn test_merge_overlapping_and_abutting() {
        let a = epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-10");
        let b = epoch("CH", "HASLI", "HHZ", "2019-01-05", "2019-01-20");
        let c = epoch("CH", "HASLI", "HHZ", "2019-01-20", "2019-01-25");
        assert!(a.mergeable(&b));
        assert!(b.mergeable(&c)); // abutting

        let merged = merge_epochs(vec![c.clone(), a.clone(), b.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, a.start);
        assert_eq!(merged[0].end, c.end);
    }

    #[test]
    fn test_merge_keeps_disjoint_and_foreign_streams() {
        let a = epoch("CH", "HASLI", "HHZ", "2019-01-01", "2019-01-02");
        let gap = epoch("CH", "HASLI", "HHZ", "2019-01-05", "2019-01-06");
        let other = epoch("GR", "BFO", "HHZ", "2019-01-01", "2019-01-02");
        let merged = merge_epochs(vec![a, gap, other]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_canonical_ordering() {
        let a = epoch("CH", "AAA", "HHZ", "2019-01-01", "2019-01-02");
        let b = epoch("CH", "AAA", "HHZ", "2019-02-01", "2019-02-02");
        let c = epoch("GR", "AAA", "HHZ", "2019-01-01", "2019-01-02");
        let mut v = vec![c.clone(), b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }
}
