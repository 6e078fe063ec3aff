use crate::drain::DrainClosed;
use crate::error::FederatorError;
use crate::routing::Level;
use crate::sncl::format_time;
use crate::worker::{fetch_epoch, read_body, FetchResult, Job, WorkerEnv};
use bytes::Bytes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use sha2::{Digest, Sha256};
use tracing::warn;

const DOCUMENT_SOURCE: &str = "EIDA";

/// Worker for FDSNStationXML responses.
///
/// A job carries all routes of one network; responses are parsed with a
/// pull parser into `Network → Station → Channel` nodes keyed by a stable
/// hash of each element's sorted attribute set, merged per the requested
/// level, and serialized under the drain lock behind the one-time document
/// header.
pub struct StationXmlWorker {
    pub level: Level,
}

/// Bodies above this size are parsed on a blocking thread so the tree walk
/// does not stall the request's event loop.
const PARSE_OFFLOAD_THRESHOLD: usize = 256 * 1024;

impl StationXmlWorker {
    pub async fn run_job(&self, env: &WorkerEnv, job: &Job) -> Result<(), FederatorError> {
        let Job::NetworkGroup { network, routes } = job else {
            return Err(FederatorError::Internal(
                "station-xml worker dispatched a route job".to_string(),
            ));
        };

        let mut merged: Vec<NetEntry> = Vec::new();
        for route in routes {
            for epoch in &route.stream_epochs {
                let body = match fetch_epoch(env, &route.url, epoch).await? {
                    FetchResult::Payload(resp) => match read_body(env, &route.url, resp).await? {
                        Some(body) => body,
                        None => continue,
                    },
                    FetchResult::NoContent => continue,
                };
                let parsed = if body.len() > PARSE_OFFLOAD_THRESHOLD {
                    tokio::task::spawn_blocking(move || parse_networks(&body))
                        .await
                        .map_err(|e| FederatorError::Internal(e.to_string()))?
                } else {
                    parse_networks(&body)
                };
                match parsed {
                    Ok(parsed) => {
                        for net in parsed {
                            merge_network(&mut merged, net, self.level);
                        }
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %route.url,
                            network = %network,
                            error = %e,
                            "worker: unparseable station-xml response, dropping"
                        );
                    }
                }
            }
        }

        if merged.is_empty() {
            return Ok(());
        }

        let guard = env.drain.lock().await;
        guard
            .write_once(Bytes::from(document_header()))
            .await
            .map_err(drain_closed)?;
        for entry in &merged {
            guard
                .write(Bytes::from(serialize_network(entry)))
                .await
                .map_err(drain_closed)?;
        }
        Ok(())
    }
}

fn drain_closed(_: DrainClosed) -> FederatorError {
    FederatorError::Cancelled
}

/// One-time document header, written before the first network element.
pub fn document_header() -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <FDSNStationXML xmlns=\"http://www.fdsn.org/xml/station/1\" schemaVersion=\"1.0\">\
         <Source>{}</Source><Created>{}</Created>",
        DOCUMENT_SOURCE,
        format_time(chrono::Utc::now()),
    )
    .into_bytes()
}

pub const DOCUMENT_FOOTER: &[u8] = b"</FDSNStationXML>";

// ---------------------------------------------------------------------------
// Parsed representation — raw serialized fragments plus attribute keys.
// ---------------------------------------------------------------------------

struct NetEntry {
    key: String,
    name: Vec<u8>,
    start_tag: Vec<u8>,
    /// Non-station children (Description, counters, ...), serialized.
    extra: Vec<u8>,
    stations: Vec<StaEntry>,
}

struct StaEntry {
    key: String,
    name: Vec<u8>,
    start_tag: Vec<u8>,
    /// Non-channel children (Latitude, Site, ...), serialized.
    extra: Vec<u8>,
    channels: Vec<Vec<u8>>,
}

/// Parse failure local to one response. The worker drops the response and
/// continues — a malformed endpoint reply is no-content for that route.
#[derive(Debug)]
pub struct XmlParseError(String);

impl std::fmt::Display for XmlParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for XmlParseError {}

impl From<quick_xml::Error> for XmlParseError {
    fn from(e: quick_xml::Error) -> Self {
        XmlParseError(e.to_string())
    }
}

impl From<std::io::Error> for XmlParseError {
    fn from(e: std::io::Error) -> Self {
        XmlParseError(e.to_string())
    }
}

fn truncated(context: &str) -> XmlParseError {
    XmlParseError(format!("unexpected end of document inside {}", context))
}

/// Stable key of an element: a hash over its sorted attribute set. Two
/// elements with identical attributes at the same depth denote the same
/// epoch.
fn element_key(e: &BytesStart<'_>) -> Result<String, XmlParseError> {
    let mut attrs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlParseError(e.to_string()))?;
        attrs.push((attr.key.as_ref().to_vec(), attr.value.to_vec()));
    }
    attrs.sort();

    let mut hasher = Sha256::new();
    for (k, v) in attrs {
        hasher.update(&k);
        hasher.update([b'=']);
        hasher.update(&v);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn serialize_start(e: &BytesStart<'_>) -> Result<Vec<u8>, XmlParseError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(e.to_owned()))?;
    Ok(writer.into_inner())
}

fn has_local_name(e: &BytesStart<'_>, name: &[u8]) -> bool {
    e.name().local_name().as_ref() == name
}

/// Parse every `<Network>` subtree out of a response body.
fn parse_networks(body: &[u8]) -> Result<Vec<NetEntry>, XmlParseError> {
    let mut reader = Reader::from_reader(body);
    let mut networks = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) if has_local_name(&e, b"Network") => {
                networks.push(parse_network(&mut reader, &e)?);
            }
            Event::Empty(e) if has_local_name(&e, b"Network") => {
                networks.push(NetEntry {
                    key: element_key(&e)?,
                    name: e.name().as_ref().to_vec(),
                    start_tag: serialize_start(&e)?,
                    extra: Vec::new(),
                    stations: Vec::new(),
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(networks)
}

fn parse_network(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<NetEntry, XmlParseError> {
    let mut entry = NetEntry {
        key: element_key(start)?,
        name: start.name().as_ref().to_vec(),
        start_tag: serialize_start(start)?,
        extra: Vec::new(),
        stations: Vec::new(),
    };
    let mut extra = Writer::new(Vec::new());

    loop {
        match reader.read_event()? {
            Event::Start(e) if has_local_name(&e, b"Station") => {
                entry.stations.push(parse_station(reader, &e)?);
            }
            Event::Empty(e) if has_local_name(&e, b"Station") => {
                entry.stations.push(StaEntry {
                    key: element_key(&e)?,
                    name: e.name().as_ref().to_vec(),
                    start_tag: serialize_start(&e)?,
                    extra: Vec::new(),
                    channels: Vec::new(),
                });
            }
            Event::Start(e) => copy_subtree(reader, &e, &mut extra)?,
            Event::End(e) if e.local_name().as_ref() == b"Network" => break,
            Event::Eof => return Err(truncated("Network")),
            other => extra.write_event(other)?,
        }
    }
    entry.extra = extra.into_inner();
    Ok(entry)
}

fn parse_station(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<StaEntry, XmlParseError> {
    let mut entry = StaEntry {
        key: element_key(start)?,
        name: start.name().as_ref().to_vec(),
        start_tag: serialize_start(start)?,
        extra: Vec::new(),
        channels: Vec::new(),
    };
    let mut extra = Writer::new(Vec::new());

    loop {
        match reader.read_event()? {
            Event::Start(e) if has_local_name(&e, b"Channel") => {
                let mut channel = Writer::new(Vec::new());
                copy_subtree(reader, &e, &mut channel)?;
                entry.channels.push(channel.into_inner());
            }
            Event::Empty(e) if has_local_name(&e, b"Channel") => {
                let mut channel = Writer::new(Vec::new());
                channel.write_event(Event::Empty(e.to_owned()))?;
                entry.channels.push(channel.into_inner());
            }
            Event::Start(e) => copy_subtree(reader, &e, &mut extra)?,
            Event::End(e) if e.local_name().as_ref() == b"Station" => break,
            Event::Eof => return Err(truncated("Station")),
            other => extra.write_event(other)?,
        }
    }
    entry.extra = extra.into_inner();
    Ok(entry)
}

/// Copy a whole element subtree (start tag included) into `writer`.
fn copy_subtree(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    writer: &mut Writer<Vec<u8>>,
) -> Result<(), XmlParseError> {
    writer.write_event(Event::Start(start.to_owned()))?;
    let mut depth = 1usize;
    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(truncated("subtree")),
            _ => {}
        }
        writer.write_event(event)?;
        if depth == 0 {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------------
// Merge rules per level.
// ---------------------------------------------------------------------------

/// Merge one parsed network into the worker's tree.
///
/// - `network`: only the outermost element is kept per key, children are
///   not carried.
/// - `station`: stations attach to the network key; an existing station key
///   wins, its subtree is never merged.
/// - `channel`/`response`: station subtrees merge; channels are always
///   appended, never deduplicated.
fn merge_network(merged: &mut Vec<NetEntry>, parsed: NetEntry, level: Level) {
    match level {
        Level::Network => {
            if !merged.iter().any(|n| n.key == parsed.key) {
                merged.push(NetEntry {
                    extra: Vec::new(),
                    stations: Vec::new(),
                    ..parsed
                });
            }
        }
        Level::Station => {
            let entry = emerge_network(merged, parsed.key.clone(), || NetEntry {
                key: parsed.key.clone(),
                name: parsed.name.clone(),
                start_tag: parsed.start_tag.clone(),
                extra: parsed.extra.clone(),
                stations: Vec::new(),
            });
            for sta in parsed.stations {
                if !entry.stations.iter().any(|s| s.key == sta.key) {
                    entry.stations.push(sta);
                }
            }
        }
        Level::Channel | Level::Response => {
            let entry = emerge_network(merged, parsed.key.clone(), || NetEntry {
                key: parsed.key.clone(),
                name: parsed.name.clone(),
                start_tag: parsed.start_tag.clone(),
                extra: parsed.extra.clone(),
                stations: Vec::new(),
            });
            for sta in parsed.stations {
                match entry.stations.iter_mut().find(|s| s.key == sta.key) {
                    Some(existing) => existing.channels.extend(sta.channels),
                    None => entry.stations.push(sta),
                }
            }
        }
    }
}

fn emerge_network<'a>(
    merged: &'a mut Vec<NetEntry>,
    key: String,
    make: impl FnOnce() -> NetEntry,
) -> &'a mut NetEntry {
    if let Some(pos) = merged.iter().position(|n| n.key == key) {
        return &mut merged[pos];
    }
    merged.push(make());
    merged.last_mut().unwrap()
}

fn serialize_network(entry: &NetEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&entry.start_tag);
    out.extend_from_slice(&entry.extra);
    for sta in &entry.stations {
        out.extend_from_slice(&sta.start_tag);
        out.extend_from_slice(&sta.extra);
        for channel in &sta.channels {
            out.extend_from_slice(channel);
        }
        out.extend_from_slice(b"</");
        out.extend_from_slice(&sta.name);
        out.push(b'>');
    }
    out.extend_from_slice(b"</");
    out.extend_from_slice(&entry.name);
    out.push(b'>');
    out
}
