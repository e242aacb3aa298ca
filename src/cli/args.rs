use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nodefuse", version)]
#[command(about = "Serve a directory through a userspace FUSE loopback filesystem")]
pub struct Args {
    #[arg(help = "Directory whose contents are served")]
    pub backing_dir: PathBuf,

    #[arg(help = "Where to mount the filesystem")]
    pub mountpoint: PathBuf,

    #[arg(long, help = "Config file (default: config.toml in the config directory)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Log every request and reply")]
    pub debug: bool,

    #[arg(long, help = "Print per-operation latencies on exit")]
    pub latency: bool,

    #[arg(long, help = "Recognize hard links by backing inode number")]
    pub client_inodes: bool,
}
