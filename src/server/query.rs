use crate::error::FederatorError;
use crate::processor::{FedRequest, ResponseFormat};
use crate::routing::resolver::BoundingBox;
use crate::routing::{Level, Selection};
use crate::sncl::{parse_time, Stream, StreamEpoch};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Map a request path to its federated service id.
pub fn match_service(path: &str) -> Option<&'static str> {
    match path {
        "/fdsnws/dataselect/1/query" => Some("dataselect"),
        "/fdsnws/station/1/query" => Some("station"),
        "/fdsnws/availability/1/query" => Some("availability"),
        "/eidaws/wfcatalog/1/query" => Some("wfcatalog"),
        _ => None,
    }
}

/// Parse a GET query string into a validated request.
pub fn parse_get(service: &'static str, query: &str) -> Result<FedRequest, FederatorError> {
    let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    build_request(service, params, None)
}

/// Parse a POST body: `key=value` parameter lines followed by one stream
/// epoch line per requested epoch.
pub fn parse_post(service: &'static str, body: &str) -> Result<FedRequest, FederatorError> {
    let mut params = Vec::new();
    let mut epochs = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            // Epoch lines never contain '=', parameter lines always do.
            params.push((key.trim().to_string(), value.trim().to_string()));
            continue;
        }
        let epoch = StreamEpoch::parse_line(line).map_err(FederatorError::Validation)?;
        epochs.push(epoch);
    }
    if epochs.is_empty() {
        return Err(FederatorError::Validation(
            "POST body carries no stream epoch lines".to_string(),
        ));
    }
    build_request(service, params, Some(epochs))
}

fn build_request(
    service: &'static str,
    params: Vec<(String, String)>,
    post_epochs: Option<Vec<StreamEpoch>>,
) -> Result<FedRequest, FederatorError> {
    let mut parsed = Params::default();
    for (key, value) in &params {
        parsed.set(service, key, value)?;
    }

    let nodata = match parsed.nodata.as_deref() {
        None => 204,
        Some("204") => 204,
        Some("404") => 404,
        Some(other) => {
            return Err(FederatorError::Validation(format!(
                "nodata must be 204 or 404, got {other}"
            )))
        }
    };

    let level = match parsed.level.as_deref() {
        None => Level::Station,
        Some(s) => Level::from_str(s).map_err(FederatorError::Validation)?,
    };

    let format = resolve_format(service, parsed.format.as_deref(), level)?;

    let stream_epochs = match post_epochs {
        Some(epochs) => epochs,
        None => expand_get_epochs(&parsed)?,
    };

    let bounding_box = parsed.bounding_box()?;
    let extra_params = endpoint_params(service, &format, level, &parsed);

    Ok(FedRequest {
        service: service.to_string(),
        format,
        selection: Selection {
            service: service.to_string(),
            level: match format {
                ResponseFormat::StationXml { .. } | ResponseFormat::Text
                    if service == "station" =>
                {
                    level
                }
                _ => Level::Channel,
            },
            access: None,
            bounding_box,
            stream_epochs,
        },
        extra_params,
        nodata,
    })
}

/// Accumulated, alias-normalized query parameters.
#[derive(Default)]
struct Params {
    network: Option<String>,
    station: Option<String>,
    location: Option<String>,
    channel: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    format: Option<String>,
    level: Option<String>,
    nodata: Option<String>,
    quality: Option<String>,
    min_latitude: Option<f64>,
    max_latitude: Option<f64>,
    min_longitude: Option<f64>,
    max_longitude: Option<f64>,
}

impl Params {
    fn set(&mut self, service: &str, key: &str, value: &str) -> Result<(), FederatorError> {
        let invalid_float = || {
            FederatorError::Validation(format!("parameter {key} is not a number: {value:?}"))
        };
        match key {
            "network" | "net" => self.network = Some(value.to_string()),
            "station" | "sta" => self.station = Some(value.to_string()),
            "location" | "loc" => self.location = Some(value.to_string()),
            "channel" | "cha" => self.channel = Some(value.to_string()),
            "starttime" | "start" => {
                self.start = Some(parse_time(value).map_err(FederatorError::Validation)?)
            }
            "endtime" | "end" => {
                self.end = Some(parse_time(value).map_err(FederatorError::Validation)?)
            }
            "format" => self.format = Some(value.to_string()),
            "nodata" => self.nodata = Some(value.to_string()),
            "level" if service == "station" => self.level = Some(value.to_string()),
            "quality" if service == "dataselect" => self.quality = Some(value.to_string()),
            "minlatitude" if service == "station" => {
                self.min_latitude = Some(value.parse().map_err(|_| invalid_float())?)
            }
            "maxlatitude" if service == "station" => {
                self.max_latitude = Some(value.parse().map_err(|_| invalid_float())?)
            }
            "minlongitude" if service == "station" => {
                self.min_longitude = Some(value.parse().map_err(|_| invalid_float())?)
            }
            "maxlongitude" if service == "station" => {
                self.max_longitude = Some(value.parse().map_err(|_| invalid_float())?)
            }
            _ => {
                return Err(FederatorError::Validation(format!(
                    "unknown parameter for {service}: {key}"
                )))
            }
        }
        Ok(())
    }

    fn bounding_box(&self) -> Result<Option<BoundingBox>, FederatorError> {
        match (
            self.min_latitude,
            self.max_latitude,
            self.min_longitude,
            self.max_longitude,
        ) {
            (None, None, None, None) => Ok(None),
            (Some(min_latitude), Some(max_latitude), Some(min_longitude), Some(max_longitude)) => {
                Ok(Some(BoundingBox {
                    min_latitude,
                    max_latitude,
                    min_longitude,
                    max_longitude,
                }))
            }
            _ => Err(FederatorError::Validation(
                "a bounding box requires all four of minlatitude, maxlatitude, \
                 minlongitude, maxlongitude"
                    .to_string(),
            )),
        }
    }
}

fn resolve_format(
    service: &str,
    format: Option<&str>,
    level: Level,
) -> Result<ResponseFormat, FederatorError> {
    let unsupported = |got: &str| {
        FederatorError::Validation(format!("unsupported format for {service}: {got}"))
    };
    match service {
        "dataselect" => match format {
            None | Some("miniseed") => Ok(ResponseFormat::MiniSeed),
            Some(other) => Err(unsupported(other)),
        },
        "station" => match format {
            None | Some("xml") => Ok(ResponseFormat::StationXml { level }),
            Some("text") => Ok(ResponseFormat::Text),
            Some(other) => Err(unsupported(other)),
        },
        "availability" => match format {
            None | Some("text") => Ok(ResponseFormat::Text),
            Some(other) => Err(unsupported(other)),
        },
        "wfcatalog" => match format {
            None | Some("json") => Ok(ResponseFormat::Json),
            Some(other) => Err(unsupported(other)),
        },
        other => Err(FederatorError::Internal(format!(
            "unregistered service: {other}"
        ))),
    }
}

/// Expand comma lists in the identifier parameters into the cartesian set of
/// streams, each paired with the requested interval.
fn expand_get_epochs(params: &Params) -> Result<Vec<StreamEpoch>, FederatorError> {
    let split = |field: &Option<String>| -> Vec<String> {
        match field {
            Some(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
            _ => vec!["*".to_string()],
        }
    };

    let networks = split(&params.network);
    let stations = split(&params.station);
    let locations = split(&params.location);
    let channels = split(&params.channel);

    let mut epochs = Vec::new();
    for net in &networks {
        for sta in &stations {
            for loc in &locations {
                for cha in &channels {
                    let loc = if loc == "--" { "" } else { loc.as_str() };
                    let epoch = StreamEpoch::new(
                        Stream::new(net, sta, loc, cha),
                        params.start,
                        params.end,
                    )
                    .map_err(FederatorError::Validation)?;
                    epochs.push(epoch);
                }
            }
        }
    }
    Ok(epochs)
}

/// Parameters forwarded to every endpoint request for this service.
fn endpoint_params(
    service: &str,
    format: &ResponseFormat,
    level: Level,
    params: &Params,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    match (service, format) {
        ("station", ResponseFormat::StationXml { .. }) => {
            out.push(("level".into(), level.as_str().into()));
            out.push(("format".into(), "xml".into()));
        }
        ("station", _) => {
            out.push(("level".into(), level.as_str().into()));
            out.push(("format".into(), "text".into()));
        }
        ("availability", _) => out.push(("format".into(), "text".into())),
        _ => {}
    }
    if let Some(ref quality) = params.quality {
        out.push(("quality".into(), quality.clone()));
    }
    if let (Some(min_lat), Some(max_lat), Some(min_lon), Some(max_lon)) = (
        params.min_latitude,
        params.max_latitude,
        params.min_longitude,
        params.max_longitude,
    ) {
        out.push(("minlatitude".into(), min_lat.to_string()));
        out.push(("maxlatitude".into(), max_lat.to_string()));
        out.push(("minlongitude".into(), min_lon.to_string()));
        out.push(("maxlongitude".into(), max_lon.to_string()));
    }
    out
}
