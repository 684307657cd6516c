//! Bounded output capture.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default per-stream capture limit.
pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

/// Read `reader` to EOF, keeping at most `cap` bytes.
///
/// Bytes past the cap are counted and discarded, so the child never blocks
/// on a full pipe. A truncation marker is appended when anything was dropped.
pub async fn read_bounded<R>(mut reader: R, cap: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(cap.min(8192));
    let mut dropped: u64 = 0;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&buf[..take]);
        dropped += (n - take) as u64;
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[... truncated {} bytes]", dropped));
    }
    Ok(text)
}
