//! `server.json` — the discovery artifact the CLI reads to find a running
//! gateway. Written on boot, removed on clean shutdown; a leftover file
//! from a dead process is replaced.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SERVER_META_FILE: &str = "server.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMeta {
    pub pid: u32,
    pub port: u16,
    pub url: String,
}

pub fn write(store_dir: &Path, port: u16, bind: &str) -> std::io::Result<PathBuf> {
    let path = store_dir.join(SERVER_META_FILE);
    if let Ok(raw) = std::fs::read_to_string(&path) {
        match serde_json::from_str::<ServerMeta>(&raw) {
            Ok(stale) => warn!(stale_pid = stale.pid, "replacing leftover server.json"),
            Err(_) => warn!("replacing unreadable server.json"),
        }
    }
    let meta = ServerMeta {
        pid: std::process::id(),
        port,
        url: format!("http://{bind}:{port}"),
    };
    std::fs::write(&path, serde_json::to_string(&meta)?)?;
    info!(path = %path.display(), url = %meta.url, "server.json written");
    Ok(path)
}

pub fn remove(store_dir: &Path) {
    let path = store_dir.join(SERVER_META_FILE);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to remove server.json");
        }
    }
}
