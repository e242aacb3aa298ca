use crate::cli::Args;
use nodefuse::{FuseError, Result};
use std::path::Path;

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        return Err(FuseError::Config(format!(
            "{} '{}' is not a directory",
            what,
            path.display()
        )));
    }
    Ok(())
}

pub fn validate_mount_args(args: &Args) -> Result<()> {
    require_dir(&args.backing_dir, "Backing directory")?;
    require_dir(&args.mountpoint, "Mount point")?;

    let backing = args.backing_dir.canonicalize()?;
    let mountpoint = args.mountpoint.canonicalize()?;
    if backing == mountpoint {
        return Err(FuseError::Config(
            "Backing directory and mount point must differ".to_string(),
        ));
    }
    if backing.starts_with(&mountpoint) {
        return Err(FuseError::Config(
            "Backing directory cannot be inside the mount point".to_string(),
        ));
    }

    Ok(())
}
