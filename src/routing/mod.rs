pub mod parser;
pub mod resolver;

pub use resolver::{Level, RouteResolver, Selection};

use crate::sncl::StreamEpoch;
use std::collections::BTreeMap;

/// Routing service output: endpoint URL → ordered stream epochs.
/// Ephemeral — built per client request and consumed by the processor.
pub type RoutingTable = BTreeMap<String, Vec<StreamEpoch>>;

/// One endpoint URL together with the stream epochs it serves.
/// Epochs are kept in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub url: String,
    pub stream_epochs: Vec<StreamEpoch>,
}

/// Demultiplex a routing table into one route per stream epoch.
pub fn demux_routes(table: &RoutingTable) -> Vec<Route> {
    table
        .iter()
        .flat_map(|(url, epochs)| {
            epochs.iter().map(|se| Route {
                url: url.clone(),
                stream_epochs: vec![se.clone()],
            })
        })
        .collect()
}

/// Group demultiplexed routes by network code, preserving first-seen
/// network order. Used by the StationXML processor so that one worker owns
/// all routes of a network.
pub fn group_routes_by_network(routes: Vec<Route>) -> Vec<(String, Vec<Route>)> {
    let mut groups: Vec<(String, Vec<Route>)> = Vec::new();
    for route in routes {
        let net = route.stream_epochs[0].stream.network.clone();
        match groups.iter_mut().find(|(key, _)| *key == net) {
            Some((_, members)) => members.push(route),
            None => groups.push((net, vec![route])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::{parse_time, Stream};

    fn epoch(net: &str, sta: &str, start: &str, end: &str) -> StreamEpoch {
        StreamEpoch::new(
            Stream::new(net, sta, "", "HHZ"),
            Some(parse_time(start).unwrap()),
            Some(parse_time(end).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn test_demux_one_route_per_epoch() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://eida.ethz.ch/fdsnws/station/1/query".into(),
            vec![
                epoch("CH", "HASLI", "2019-01-01", "2019-01-02"),
                epoch("CH", "DAVOX", "2019-01-01", "2019-01-02"),
            ],
        );
        let routes = demux_routes(&table);
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.stream_epochs.len() == 1));
    }

    #[test]
    fn test_group_by_network() {
        let mut table = RoutingTable::new();
        table.insert(
            "http://a.example.org/q".into(),
            vec![
                epoch("CH", "HASLI", "2019-01-01", "2019-01-02"),
                epoch("GR", "BFO", "2019-01-01", "2019-01-02"),
            ],
        );
        table.insert(
            "http://b.example.org/q".into(),
            vec![epoch("CH", "DAVOX", "2019-01-01", "2019-01-02")],
        );
        let groups = group_routes_by_network(demux_routes(&table));
        assert_eq!(groups.len(), 2);
        let ch = groups.iter().find(|(k, _)| k == "CH").unwrap();
        assert_eq!(ch.1.len(), 2);
    }
}
