//! Runtime configuration: data directory, cache tunables, and the listen
//! address, parsed from the command line via `clap`.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chunkkv-server", about = "Chunked key-value store server")]
pub struct Config {
    /// Directory holding the mapping file, chunk files, and oplog.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Maximum number of chunks simultaneously resident.
    #[arg(long, default_value_t = chunkkv_engine::DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Mutations per snapshot.
    #[arg(long, default_value_t = chunkkv_engine::DEFAULT_WRT_OP)]
    pub wrt_op: u32,

    /// Address to bind the HTTP/JSON RPC surface to.
    #[arg(long, default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,
}
