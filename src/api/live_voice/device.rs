//! Scoped ownership of platform audio streams

use std::sync::mpsc;
use tracing::{debug, warn};

use super::error::DeviceError;

/// Releases an acquired device exactly once, when dropped
pub struct DeviceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Build a cpal stream on its own thread and keep it alive until the guard drops.
///
/// `cpal::Stream` is not `Send` on every host, so the stream never leaves the
/// thread that created it. Build errors are reported synchronously.
pub(crate) fn spawn_device_thread<F>(name: &str, build: F) -> Result<DeviceGuard, DeviceError>
where
    F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let device_name = name.to_string();

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Returns once the guard drops the sender
            let _ = release_rx.recv();
            drop(stream);
            debug!(device = %device_name, "audio device released");
        })
        .map_err(|e| DeviceError::Thread(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            let device_name = name.to_string();
            Ok(DeviceGuard::new(move || {
                drop(release_tx);
                if handle.join().is_err() {
                    warn!(device = %device_name, "audio device thread panicked");
                }
            }))
        }
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(DeviceError::Thread(
                "device thread exited during setup".to_string(),
            ))
        }
    }
}
