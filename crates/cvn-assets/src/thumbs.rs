// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background thumbnail generation for image assets.
//!
//! A single worker thread drains a bounded queue; when the queue is full the
//! request is dropped and logged. Thumbnail failures are logged and never
//! fail the registration that queued them.

use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use tracing::{debug, warn};

/// Longest edge of a generated thumbnail.
pub const THUMBNAIL_MAX_DIM: u32 = 512;
/// Pending thumbnail requests before new ones are shed.
const QUEUE_CAPACITY: usize = 64;

/// A thumbnail request.
pub(crate) struct ThumbJob {
    pub uid: String,
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Result callback: `(uid, thumbnail_path)` on success.
pub(crate) type ThumbCallback = Box<dyn Fn(&str, &PathBuf) + Send + Sync>;

pub(crate) struct ThumbnailWorker {
    tx: SyncSender<ThumbJob>,
}

impl ThumbnailWorker {
    /// Spawn the worker thread. `on_done` runs on the worker thread after a
    /// thumbnail lands on disk.
    pub(crate) fn spawn(on_done: ThumbCallback) -> Self {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        std::thread::Builder::new()
            .name("cvn-thumbs".into())
            .spawn(move || run(rx, on_done))
            .expect("spawn thumbnail worker");
        Self { tx }
    }

    /// Enqueue a request; drops (with a log line) when the queue is full.
    pub(crate) fn enqueue(&self, job: ThumbJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(uid = %job.uid, "thumbnail queue full, dropping request");
            }
            Err(TrySendError::Disconnected(job)) => {
                warn!(uid = %job.uid, "thumbnail worker gone, dropping request");
            }
        }
    }
}

fn run(rx: Receiver<ThumbJob>, on_done: ThumbCallback) {
    while let Ok(job) = rx.recv() {
        match generate(&job) {
            Ok(()) => {
                debug!(uid = %job.uid, dest = %job.dest.display(), "thumbnail written");
                on_done(&job.uid, &job.dest);
            }
            Err(e) => {
                warn!(uid = %job.uid, error = %e, "thumbnail generation failed");
            }
        }
    }
}

fn generate(job: &ThumbJob) -> Result<(), image::ImageError> {
    let img = image::open(&job.source)?;
    // `thumbnail` preserves aspect ratio within the bounding box.
    let thumb = img.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM);
    thumb.save(&job.dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn generates_a_bounded_png() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("big.png");
        let dest = tmp.path().join("big.png.thumb.png");
        let img = image::RgbImage::from_pixel(1024, 256, image::Rgb([10, 20, 30]));
        img.save(&src).unwrap();

        let (done_tx, done_rx) = channel();
        let worker = ThumbnailWorker::spawn(Box::new(move |uid, path| {
            done_tx.send((uid.to_string(), path.clone())).unwrap();
        }));
        worker.enqueue(ThumbJob {
            uid: "u1".into(),
            source: src,
            dest: dest.clone(),
        });

        let (uid, path) = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(uid, "u1");
        let thumb = image::open(&path).unwrap();
        assert!(thumb.width() <= THUMBNAIL_MAX_DIM);
        assert!(thumb.height() <= THUMBNAIL_MAX_DIM);
        // Aspect preserved: 4:1 input stays 4:1.
        assert_eq!(thumb.width(), 512);
        assert_eq!(thumb.height(), 128);
    }

    #[test]
    fn failure_is_non_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("not-an-image.png");
        std::fs::write(&src, b"plain text").unwrap();

        let worker = ThumbnailWorker::spawn(Box::new(|_, _| {
            panic!("callback must not run on failure");
        }));
        worker.enqueue(ThumbJob {
            uid: "u2".into(),
            source: src,
            dest: tmp.path().join("out.png"),
        });
        // Give the worker a moment; absence of a panic is the assertion.
        std::thread::sleep(Duration::from_millis(300));
    }
}
