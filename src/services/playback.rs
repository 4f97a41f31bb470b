use crate::core::io::Storage;
use crate::core::state::AudioArtifact;
use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub audio: AudioArtifact,
    pub text: String,
    /// Global, gap-free position in the session's output.
    pub output_index: u64,
    pub phase_index: u64,
    pub segment_index: usize,
}

/// Receives items in output order. Must not block.
pub trait PlaybackSink: Send + Sync {
    fn enqueue(&self, item: PlaybackItem);

    /// Called when the session is abandoned; later items may be dropped.
    fn close(&self) {}
}

/// Forwards items to a channel until closed; afterwards drops them.
///
/// Closing drops the sender, so the receiver ends once it has taken every
/// item enqueued before the close.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<PlaybackItem>>>,
}

impl ChannelSink {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<PlaybackItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

}

impl PlaybackSink for ChannelSink {
    fn enqueue(&self, item: PlaybackItem) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(item).is_err() {
                    warn!("Playback receiver dropped");
                }
            }
            None => debug!(
                "Discarding output #{} (phase={} segment={}) after close",
                item.output_index, item.phase_index, item.segment_index
            ),
        }
    }

    fn close(&self) {
        if self.tx.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            info!("Playback sink closed");
        }
    }
}

/// Writes every received item to `<folder>/<output_index>.<ext>` until the
/// channel closes. Silent items are skipped. Returns paths in output order.
pub async fn write_playback(
    mut rx: mpsc::UnboundedReceiver<PlaybackItem>,
    storage: Arc<dyn Storage>,
    folder: &str,
    ext: &str,
) -> Result<Vec<String>> {
    let mut written = Vec::new();
    while let Some(item) = rx.recv().await {
        info!("[{:05}] {}", item.output_index, item.text);
        if item.audio.is_empty() {
            debug!(
                "Skipping silent output #{} (phase={} segment={})",
                item.output_index, item.phase_index, item.segment_index
            );
            continue;
        }
        let path = format!("{}/{:05}.{}", folder, item.output_index, ext);
        storage.write(&path, &item.audio.data).await?;
        written.push(path);
    }
    Ok(written)
}
