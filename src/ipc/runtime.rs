use anyhow::{Result, anyhow};
use directories::UserDirs;
use std::{fs, path::PathBuf};

/// `~/.local/run`, created on demand.
pub fn runtime_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?
        .home_dir()
        .to_path_buf();
    let dir = home.join(".local").join("run");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Control socket for CLI requests.
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("facectl.sock"))
}

/// Where the detector connects when `[source] kind = "socket"`.
pub fn landmarks_socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("facectl-landmarks.sock"))
}
