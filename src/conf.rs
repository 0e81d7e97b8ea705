//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id.
pub const DEFAULT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub swarm: SwarmConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
            swarm: SwarmConf::default(),
        }
    }
}

/// Configuration for the choke scheduler and piece selector, shared by all
/// torrents unless a torrent overrides it.
#[derive(Clone, Copy, Debug)]
pub struct SwarmConf {
    /// How often the choke scheduler re-evaluates the unchoke slate.
    pub unchoke_period: Duration,

    /// One optimistic unchoke happens every this many ticks. At the default
    /// of 3 ticks and a 3 second period, that's roughly every 9 seconds,
    /// which is frequent enough to let new peers bootstrap a reciprocity
    /// relationship without flooding upload slots with untested peers.
    pub optimistic_iterations: usize,

    /// The number of interested peers we keep unchoked purely by download
    /// (or, once seeding, upload) rate. Four is the BitTorrent mainline
    /// default and balances upload saturation against per-peer throughput.
    pub max_downloaders_unchoke: usize,

    /// Fraction of pieces completed before the piece selector is allowed to
    /// re-request a piece that's already being fetched from another peer.
    pub end_game_completion_ratio: f64,

    /// The smoothing window, in scheduler ticks, used for the moving
    /// average of peers' transfer rates.
    pub rate_computation_iterations: usize,
}

impl Default for SwarmConf {
    fn default() -> Self {
        Self {
            unchoke_period: Duration::from_secs(3),
            optimistic_iterations: 3,
            max_downloaders_unchoke: 4,
            end_game_completion_ratio: 0.95,
            rate_computation_iterations: 2,
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
        }
    }
}
