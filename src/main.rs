use clap::Parser;
use std::sync::Arc;

mod cli;

use cli::Args;
use nodefuse::{
    load_config, FileSystemConnector, FuseError, LoopbackFileSystem, MountState, PathNodeFs,
};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> nodefuse::Result<i32> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("NODEFUSE_LOG").unwrap_or_else(|_| default_level.to_string()),
        )
        .init();

    cli::validate_mount_args(&args)?;

    let mut config = load_config(args.config.as_deref())?;
    config.mount.debug |= args.debug;
    config.mount.latency |= args.latency;
    config.pathfs.client_inodes |= args.client_inodes;

    let backing_dir = args.backing_dir.canonicalize()?;
    let loopback = Arc::new(LoopbackFileSystem::new(&backing_dir));
    let pathfs = PathNodeFs::new(loopback, config.pathfs.clone());
    let connector = if config.fs.portable_inodes {
        FileSystemConnector::new(pathfs, config.fs.clone())
    } else {
        // SAFETY: node ids only come back from the kernel this connector
        // is mounted on, which never uses an id after forgetting it.
        unsafe { FileSystemConnector::new_with_address_handles(pathfs, config.fs.clone()) }
    };

    let state = Arc::new(MountState::new(connector, config.mount.clone())?);
    state.mount(&args.mountpoint)?;
    println!(
        "Serving {} on {} (Ctrl-C to unmount)",
        backing_dir.display(),
        args.mountpoint.display()
    );

    let serving = state.clone();
    let mut server = tokio::task::spawn_blocking(move || serving.serve());

    let joined = tokio::select! {
        joined = &mut server => joined,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, unmounting {}", args.mountpoint.display());
            state.unmount()?;
            server.await
        }
    };
    let served = joined.map_err(|e| FuseError::Io(std::io::Error::other(e)))?;

    if let Some(latencies) = state.latencies() {
        println!("{}", latencies.report());
    }
    if config.mount.debug {
        println!("{}", state.buffer_stats());
    }

    served?;
    Ok(0)
}
