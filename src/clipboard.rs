//! Clipboard copy of the session summary
//!
//! `arboard::Clipboard` is not `Send`, so every copy runs on its own thread.
//! On Linux/X11 the clipboard is owned by the process that set it, so that
//! thread stays alive until another application takes ownership.

use std::sync::mpsc;
use std::time::Duration;

/// How long to wait for the copy thread to report back
const RESULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Copy `text` to the system clipboard
pub async fn copy_text(text: String) -> Result<(), String> {
    let (result_tx, result_rx) = mpsc::sync_channel::<Result<(), String>>(1);

    std::thread::Builder::new()
        .name("medivoice-clipboard".to_string())
        .spawn(move || {
            let mut clipboard = match arboard::Clipboard::new() {
                Ok(clipboard) => clipboard,
                Err(e) => {
                    let _ = result_tx.send(Err(format!("Clipboard access failed: {}", e)));
                    return;
                }
            };
            if let Err(e) = clipboard.set_text(text.as_str()) {
                let _ = result_tx.send(Err(format!("Clipboard set failed: {}", e)));
                return;
            }

            log::info!("Copied {} chars to clipboard", text.len());
            let _ = result_tx.send(Ok(()));

            #[cfg(target_os = "linux")]
            hold_ownership(&mut clipboard, &text);
        })
        .map_err(|e| format!("Failed to start clipboard thread: {}", e))?;

    match tokio::task::spawn_blocking(move || result_rx.recv_timeout(RESULT_TIMEOUT)).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("Clipboard operation timed out".to_string()),
        Err(e) => Err(format!("Clipboard task failed: {}", e)),
    }
}

/// Keep serving the selection for up to 30 seconds, or until it changes
#[cfg(target_os = "linux")]
fn hold_ownership(clipboard: &mut arboard::Clipboard, text: &str) {
    use std::time::Instant;

    let start = Instant::now();
    let timeout = Duration::from_secs(30);

    while start.elapsed() < timeout {
        std::thread::sleep(Duration::from_millis(100));
        match clipboard.get_text() {
            Ok(current) if current == text => {}
            _ => {
                log::debug!("Clipboard ownership transferred");
                break;
            }
        }
    }
    log::debug!("Clipboard thread exiting after {:?}", start.elapsed());
}
