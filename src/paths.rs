//! Filesystem locations for sockets, ephemeral TLS material, and config.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Directory for runtime artifacts: IPC sockets and per-pool TLS files.
pub fn runtime_dir() -> PathBuf {
    runtime_dir_candidates()
        .into_iter()
        .next()
        .unwrap_or_else(per_user_tmp_dir)
}

/// Ensure the runtime directory exists and is user-private.
pub fn ensure_runtime_dir() -> std::io::Result<PathBuf> {
    let mut last_err: Option<std::io::Error> = None;
    for dir in runtime_dir_candidates() {
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&dir)?.permissions().mode() & 0o777;
                if mode != 0o700 {
                    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
                }
                return Ok(dir);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::other("unable to create a writable runtime directory")))
}

pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir).join("taskmill");
    }
    if let Ok(home) = std::env::var("HOME")
        && !home.trim().is_empty()
    {
        return PathBuf::from(home).join(".config").join("taskmill");
    }
    per_user_tmp_dir()
}

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// A process-unique local endpoint name for the given pool.
pub fn local_endpoint_name(pool: &str) -> String {
    format!(
        "tm-{}-{}-{}",
        pool,
        std::process::id(),
        NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed)
    )
}

/// Path for an IPC socket serving the given pool.
pub fn ipc_socket_path(pool: &str) -> std::io::Result<PathBuf> {
    Ok(ensure_runtime_dir()?.join(format!("{}.sock", local_endpoint_name(pool))))
}

/// Path used to hand ephemeral TLS trust anchors to spawned daemons.
pub fn tls_anchor_path(pool: &str) -> std::io::Result<PathBuf> {
    Ok(ensure_runtime_dir()?.join(format!("{}-ca.pem", local_endpoint_name(pool))))
}

fn per_user_tmp_dir() -> PathBuf {
    let uid = nix::unistd::geteuid();
    PathBuf::from("/tmp").join(format!("taskmill-{uid}"))
}

fn runtime_dir_candidates() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        dirs.push(PathBuf::from(dir).join("taskmill"));
    }
    dirs.push(per_user_tmp_dir());
    dirs
}
