use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use classic_server::Config;
use classic_world::Dimensions;

/// A Minecraft Classic 0.30 server backed by a run-length encoded world file.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:25565")]
    address: SocketAddr,

    /// Path of the RLE world file, created on first run if missing.
    #[arg(long, default_value = "world.rle")]
    world: PathBuf,

    /// Path of the identity database.
    #[arg(long, default_value = "users.json")]
    users: PathBuf,

    /// World extent along X.
    #[arg(long, default_value_t = 2560)]
    size_x: u16,

    /// World extent along Y.
    #[arg(long, default_value_t = 128)]
    size_y: u16,

    /// World extent along Z.
    #[arg(long, default_value_t = 2560)]
    size_z: u16,

    /// Server name shown to joining clients.
    #[arg(long, default_value = "RLE Server")]
    name: String,

    /// Message of the day shown below the server name.
    #[arg(long, default_value = "Direct-Stream")]
    motd: String,

    /// Player name granted operator commands. May be repeated.
    #[arg(long = "admin")]
    admins: Vec<String>,

    /// Seconds between background world saves.
    #[arg(long, default_value_t = 300)]
    autosave_secs: u64,

    /// Simultaneous player cap (the wire id space tops out at 128).
    #[arg(long, default_value_t = 128)]
    max_players: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    let config = Config {
        address: cli.address,
        world_path: cli.world,
        users_path: cli.users,
        dimensions: Dimensions::new(cli.size_x, cli.size_y, cli.size_z),
        server_name: cli.name,
        motd: cli.motd,
        admins: cli.admins,
        autosave_interval: Duration::from_secs(cli.autosave_secs),
        max_players: cli.max_players,
        ..Config::default()
    };

    classic_server::run(config).await
}
