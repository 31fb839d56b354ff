use std::time::Duration;
use tokio::sync::mpsc;
use webterm_pty::SpawnConfig;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `sh -c <script>`
pub fn sh(script: &str) -> SpawnConfig {
    SpawnConfig::new("sh").arg("-c").arg(script)
}

/// Interactive `sh` without a user profile, so the prompt stays predictable.
pub fn interactive_sh() -> SpawnConfig {
    SpawnConfig::new("sh").env("PS1", "$ ").env("ENV", "")
}

/// Read output chunks until `needle` shows up, the channel closes, or the
/// timeout expires. Returns everything collected.
pub async fn read_until(output: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(chunk) = output.recv().await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
    })
    .await;
    String::from_utf8_lossy(&collected).into_owned()
}
