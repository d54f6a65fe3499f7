use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as a render client that joins a master.
    #[arg(long)]
    pub client: bool,

    /// Master listener to join (host:port). Falls back to CLUSTER_SYNC_SERVER,
    /// then 127.0.0.1:4242.
    #[arg(long)]
    pub server: Option<String>,

    /// Node id of this process. The master uses the id from its config.
    #[arg(long)]
    pub node_id: Option<u32>,

    /// Cluster configuration (JSON) for the master role.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of frames the master commits before sending everyone home.
    #[arg(long, default_value_t = 10)]
    pub frames: u32,

    /// Pause between frames, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub frame_interval_ms: u64,
}
