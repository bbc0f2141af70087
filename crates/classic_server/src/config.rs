use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use classic_world::{Dimensions, DEFAULT_COMPACT_CHUNK};

/// Server settings. Mutations have no effect once [`run`](crate::run) has
/// been called.
#[derive(Debug, Clone)]
pub struct Config {
    /// The socket address the server will be bound to.
    pub address: SocketAddr,
    /// Path of the RLE world file, created on first run if missing.
    pub world_path: PathBuf,
    /// Path of the identity database.
    pub users_path: PathBuf,
    /// World extent on each axis.
    pub dimensions: Dimensions,
    /// Shown to joining clients in the server identification.
    pub server_name: String,
    /// Shown to joining clients below the server name.
    pub motd: String,
    /// Names allowed to use operator commands.
    pub admins: Vec<String>,
    /// Interval between background compaction passes.
    pub autosave_interval: Duration,
    /// Block edits allowed per one-second window before the peer is kicked.
    pub max_edits_per_window: u32,
    /// Movement packets allowed per thirty-second window before the peer is
    /// kicked.
    pub max_moves_per_window: u32,
    /// Cells materialized per compaction window.
    pub compact_chunk: u64,
    /// Simultaneous live peers; the wire id space caps this at 128.
    pub max_players: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 25565).into(),
            world_path: "world.rle".into(),
            users_path: "users.json".into(),
            dimensions: Dimensions::new(2560, 128, 2560),
            server_name: "RLE Server".into(),
            motd: "Direct-Stream".into(),
            admins: Vec::new(),
            autosave_interval: Duration::from_secs(300),
            max_edits_per_window: 45,
            max_moves_per_window: 660,
            compact_chunk: DEFAULT_COMPACT_CHUNK,
            max_players: 128,
        }
    }
}
