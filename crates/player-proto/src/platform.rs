use std::path::PathBuf;

pub const CONTROL_TCP_PORT: u16 = 9877;

pub const CONTROL_TCP_HOST: &str = "127.0.0.1";

const APP_DIR: &str = "player";

/// IPC socket name for one of the two mpv playback channels.
#[cfg(unix)]
pub fn mpv_socket_name(channel: usize) -> String {
    format!(
        "{}/player-mpv-{}.sock",
        std::env::temp_dir().display(),
        channel_label(channel)
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(channel: usize) -> String {
    format!("player-mpv-{}", channel_label(channel))
}

#[cfg(unix)]
pub fn mpv_socket_arg(channel: usize) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(channel))
}

#[cfg(windows)]
pub fn mpv_socket_arg(channel: usize) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(channel))
}

/// "a" / "b", used in socket names and log lines.
pub fn channel_label(channel: usize) -> &'static str {
    if channel == 0 {
        "a"
    } else {
        "b"
    }
}

pub fn data_dir() -> PathBuf {
    // XDG layout on macOS too, for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("external").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Locate mpv: an explicit override wins, then a bundled copy next to the
/// executable, then `PATH`.
pub fn find_mpv_binary(explicit: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return p.exists().then(|| p.to_path_buf());
    }
    find_beside_exe(mpv_binary_name()).or_else(|| find_on_path(mpv_binary_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_names_differ_per_channel() {
        assert_ne!(mpv_socket_name(0), mpv_socket_name(1));
        assert!(mpv_socket_arg(1).contains("player-mpv-b"));
    }

    #[test]
    fn test_explicit_missing_binary_is_none() {
        let missing = std::path::Path::new("/definitely/not/here/mpv");
        assert!(find_mpv_binary(Some(missing)).is_none());
    }
}
