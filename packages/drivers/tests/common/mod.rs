use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Serialize tests that write and then execute scripts, so no concurrent fork
/// holds a script open for writing while it is executed.
pub async fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().await
}

/// Write an executable `/bin/sh` script standing in for a scheduler command.
///
/// Every invocation appends its arguments to `<name>.calls` next to the script.
pub fn fake_command(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    let log = dir.join(format!("{name}.calls"));
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n",
        log.display()
    );
    std::fs::write(&path, script)?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}

/// Argument lines recorded by a fake command, one per invocation.
pub fn calls(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(format!("{name}.calls")))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn path_str(path: &Path) -> String {
    path.display().to_string()
}
