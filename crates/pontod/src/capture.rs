//! Dedicated camera thread.
//!
//! V4L2 dequeues block until the driver delivers a buffer, with no
//! timeout. Running them on the async runtime would pin a worker for
//! the duration of a stall, so the device lives on its own OS thread
//! and the scan loop talks to it over channels. Dropping the request
//! channel is the release signal: the thread exits after the dequeue
//! in progress (if any) returns, and the session drop frees the device.

use ponto_hw::camera::CameraError;
use ponto_hw::{CameraSession, Frame, Orientation};
use tokio::sync::{mpsc, oneshot};

struct FrameRequest(oneshot::Sender<Result<Frame, CameraError>>);

/// Async frame source backed by a camera thread. One worker per scan.
pub struct CameraWorker {
    device_path: String,
    orientation: Orientation,
    requests: Option<mpsc::Sender<FrameRequest>>,
}

impl CameraWorker {
    pub fn new(device_path: &str, orientation: Orientation) -> Self {
        Self {
            device_path: device_path.to_string(),
            orientation,
            requests: None,
        }
    }

    /// Spawn the camera thread and wait for it to acquire the device
    /// and start a capture batch. No-op when already running.
    pub async fn acquire(&mut self) -> Result<(), CameraError> {
        if self.requests.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<FrameRequest>(1);
        let (ack_tx, ack_rx) = oneshot::channel::<Result<(), CameraError>>();
        let path = self.device_path.clone();
        let orientation = self.orientation;

        // Detached: the thread exits on its own once the request
        // channel closes; joining would block on a stalled dequeue.
        let _ = std::thread::Builder::new()
            .name("ponto-camera".into())
            .spawn(move || {
                let mut session = CameraSession::new(&path);
                if let Err(e) = session.set_orientation(orientation) {
                    let _ = ack_tx.send(Err(e));
                    return;
                }
                if let Err(e) = session.acquire() {
                    let _ = ack_tx.send(Err(e));
                    return;
                }
                tracing::debug!(
                    device = %path,
                    transform = ?session.display_transform(),
                    "camera thread ready"
                );
                let mut capture = match session.start_capture() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ack_tx.send(Err(e));
                        return;
                    }
                };
                if ack_tx.send(Ok(())).is_err() {
                    return;
                }
                while let Some(FrameRequest(reply)) = rx.blocking_recv() {
                    if reply.send(capture.next_frame()).is_err() {
                        break;
                    }
                }
                tracing::debug!(device = %path, "camera thread exiting");
            })
            .map_err(|e| CameraError::Unavailable(format!("camera thread spawn: {e}")))?;

        ack_rx
            .await
            .map_err(|_| CameraError::Unavailable("camera thread died during acquire".into()))??;
        self.requests = Some(tx);
        Ok(())
    }

    /// Request the next frame from the camera thread. The await is a
    /// real suspension point, so callers can race it against
    /// cancellation or a deadline even while the dequeue stalls.
    pub async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let requests = self.requests.as_ref().ok_or(CameraError::NotAcquired)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(FrameRequest(reply_tx))
            .await
            .map_err(|_| CameraError::CaptureFailed("camera thread exited".into()))?;
        reply_rx
            .await
            .map_err(|_| CameraError::CaptureFailed("camera thread exited".into()))?
    }

    /// Signal the camera thread to stop and release the device.
    /// Idempotent. Does not wait for a stalled dequeue to return.
    pub fn release(&mut self) {
        if self.requests.take().is_some() {
            tracing::debug!(device = %self.device_path, "camera release requested");
        }
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        self.release();
    }
}

impl crate::scan::FrameSource for CameraWorker {
    async fn acquire(&mut self) -> Result<(), CameraError> {
        CameraWorker::acquire(self).await
    }

    async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        CameraWorker::next_frame(self).await
    }

    fn release(&mut self) {
        CameraWorker::release(self)
    }
}
