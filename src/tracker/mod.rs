//! HTTP tracker announcing.
//!
//! Only the HTTP(S) tracker protocol is implemented; UDP trackers (BEP 15)
//! are a separate wire protocol built on raw sockets rather than `reqwest`,
//! and are out of scope here.

use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bencode::value::Value as BencodeValue;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Why this announce is being made, per the base protocol's `event` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// Sent with the first announce of a torrent.
    Started,
    /// Sent when the torrent is stopped, so the tracker can drop this peer
    /// from its swarm view promptly instead of waiting out its timeout.
    Stopped,
    /// Sent exactly once, when the download transitions to seeding.
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// Parameters for a single announce request.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// A tracker's response to a successful announce.
pub(crate) struct Response {
    /// How long to wait before announcing again.
    pub interval: Duration,
    /// The tracker's requested minimum: never announce sooner than this,
    /// even in response to an error.
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

/// A handle to a single tracker, reached over HTTP(S).
pub(crate) struct Tracker {
    client: reqwest::Client,
    announce_url: String,
}

impl Tracker {
    pub(crate) fn new(announce_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            announce_url,
        }
    }

    /// Sends a single announce request and parses the (bencoded) response.
    ///
    /// `info_hash` and `peer_id` are raw 20-byte strings, not valid UTF-8, so
    /// they're percent-encoded into the query string by hand rather than via
    /// `reqwest`'s `.query()`, which assumes its inputs serialize to text.
    pub(crate) async fn announce(&self, params: Announce) -> Result<Response> {
        let url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1{}",
            self.announce_url,
            if self.announce_url.contains('?') { '&' } else { '?' },
            percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            percent_encode(&params.peer_id, NON_ALPHANUMERIC),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params
                .event
                .map(|e| format!("&event={}", e.as_str()))
                .unwrap_or_default(),
        );

        log::debug!("announcing to {}", self.announce_url);
        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_response(&body)
    }
}

fn parse_response(body: &[u8]) -> Result<Response> {
    let value: BencodeValue = serde_bencode::from_bytes(body)?;
    let dict = match value {
        BencodeValue::Dict(dict) => dict,
        _ => return Err(Error::InvalidTrackerResponse("response is not a dictionary")),
    };

    if let Some(BencodeValue::Bytes(reason)) = dict.get("failure reason".as_bytes()) {
        let reason = String::from_utf8_lossy(reason).into_owned();
        log::warn!("tracker announce failed: {}", reason);
        return Err(Error::InvalidTrackerResponse("tracker returned a failure reason"));
    }

    let interval = match dict.get("interval".as_bytes()) {
        Some(BencodeValue::Int(secs)) if *secs >= 0 => Duration::from_secs(*secs as u64),
        _ => return Err(Error::InvalidTrackerResponse("missing or invalid interval")),
    };

    let min_interval = match dict.get("min interval".as_bytes()) {
        Some(BencodeValue::Int(secs)) if *secs >= 0 => Some(Duration::from_secs(*secs as u64)),
        _ => None,
    };

    let peers = match dict.get("peers".as_bytes()) {
        Some(BencodeValue::Bytes(compact)) => parse_compact_peers(compact)?,
        Some(BencodeValue::List(list)) => parse_peer_dicts(list)?,
        _ => return Err(Error::InvalidTrackerResponse("missing peers")),
    };

    Ok(Response {
        interval,
        min_interval,
        peers,
    })
}

/// Parses the compact peer string: a concatenation of 6-byte entries, 4
/// bytes of IPv4 address followed by a 2-byte big endian port.
fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 6 != 0 {
        return Err(Error::InvalidTrackerResponse(
            "compact peers string length is not a multiple of 6",
        ));
    }
    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// Parses the non-compact (dictionary model) peer list, kept around for
/// trackers that don't honor `compact=1`.
fn parse_peer_dicts(list: &[BencodeValue]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let dict = match entry {
            BencodeValue::Dict(dict) => dict,
            _ => continue,
        };
        let ip = match dict.get("ip".as_bytes()) {
            Some(BencodeValue::Bytes(ip)) => String::from_utf8_lossy(ip).into_owned(),
            _ => continue,
        };
        let port = match dict.get("port".as_bytes()) {
            Some(BencodeValue::Int(port)) => *port as u16,
            _ => continue,
        };
        if let Ok(ip) = ip.parse::<IpAddr>() {
            peers.push(SocketAddr::new(ip, port));
        }
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bencode::value::Value;
    use std::collections::BTreeMap;

    fn bencode(value: &Value) -> Vec<u8> {
        serde_bencode::to_bytes(value).unwrap()
    }

    #[test]
    fn compact_peers_parse_into_socket_addrs() {
        let mut compact = Vec::new();
        compact.extend_from_slice(&[127, 0, 0, 1]);
        compact.extend_from_slice(&6881u16.to_be_bytes());
        compact.extend_from_slice(&[10, 0, 0, 2]);
        compact.extend_from_slice(&6882u16.to_be_bytes());

        let peers = parse_compact_peers(&compact).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].port(), 6881);
        assert_eq!(peers[1].port(), 6882);
    }

    #[test]
    fn odd_length_compact_peers_is_rejected() {
        assert!(parse_compact_peers(&[0u8; 7]).is_err());
    }

    #[test]
    fn response_with_failure_reason_is_an_error() {
        let mut dict = BTreeMap::new();
        dict.insert(b"failure reason".to_vec(), Value::Bytes(b"bad request".to_vec()));
        let body = bencode(&Value::Dict(dict));
        assert!(parse_response(&body).is_err());
    }

    #[test]
    fn well_formed_response_parses_interval_and_peers() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::Int(1800));
        let mut compact = Vec::new();
        compact.extend_from_slice(&[1, 2, 3, 4]);
        compact.extend_from_slice(&6881u16.to_be_bytes());
        dict.insert(b"peers".to_vec(), Value::Bytes(compact));
        let body = bencode(&Value::Dict(dict));

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers.len(), 1);
    }
}
