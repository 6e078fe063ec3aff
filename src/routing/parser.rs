use crate::error::FederatorError;
use crate::routing::RoutingTable;
use crate::sncl::StreamEpoch;

/// Parse the routing service's plain-text reply.
///
/// The body is a sequence of blocks separated by blank lines; each block is
/// an endpoint URL on its own line followed by one stream-epoch line per
/// served epoch:
///
/// ```text
/// http://eida.ethz.ch/fdsnws/dataselect/1/query
/// CH HASLI -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00
/// CH DAVOX -- HHZ 2019-01-01T00:00:00 2019-01-05T00:00:00
///
/// http://geofon.gfz-potsdam.de/fdsnws/dataselect/1/query
/// GE APE -- BHZ 2019-01-01T00:00:00 2019-01-05T00:00:00
/// ```
pub fn parse_routing_response(body: &str) -> Result<RoutingTable, FederatorError> {
    let mut table = RoutingTable::new();
    let mut current_url: Option<String> = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            current_url = None;
            continue;
        }
        if line.starts_with("http://") || line.starts_with("https://") {
            table.entry(line.to_string()).or_default();
            current_url = Some(line.to_string());
            continue;
        }
        let url = current_url.as_ref().ok_or_else(|| {
            FederatorError::RoutingUnavailable(format!(
                "stream epoch line before any endpoint URL: {:?}",
                line
            ))
        })?;
        let epoch = StreamEpoch::parse_line(line).map_err(|e| {
            FederatorError::RoutingUnavailable(format!("malformed routing reply: {}", e))
        })?;
        table.get_mut(url).unwrap().push(epoch);
    }

    // Canonical epoch order within each block.
    for epochs in table.values_mut() {
        epochs.sort();
    }
    // A URL block with no epochs serves nothing.
    table.retain(|_, epochs| !epochs.is_empty());

    Ok(table)
}
