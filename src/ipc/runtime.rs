use anyhow::{Result, anyhow};
use directories::UserDirs;
use std::{fs, path::PathBuf};

pub fn runtime_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?
        .home_dir()
        .to_path_buf();
    let dir = home.join(".local").join("run");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// `GAZECTL_SOCKET` overrides the default `~/.local/run/gazectl.sock`.
pub fn socket_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os("GAZECTL_SOCKET") {
        return Ok(PathBuf::from(p));
    }
    Ok(runtime_dir()?.join("gazectl.sock"))
}
