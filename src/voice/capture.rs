//! Audio capture from the microphone
//!
//! The microphone is a process-wide resource; it is handed to
//! [`AudioCapture`] at construction as a [`Microphone`] and at most one
//! capture session holds it at a time. Captured audio is pushed into a
//! caller-supplied channel as opaque chunks on a fixed cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CaptureConfig;
use crate::Result;

/// Processing the capture device is asked to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 16_000,
        }
    }
}

/// One opaque slice of captured audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Position in the current capture session, starting at 0
    pub seq: u64,
    pub data: Vec<u8>,
}

/// A capture device that can be acquired exclusively
pub trait Microphone: Send + Sync {
    /// Acquire the device and start recording
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` or `Error::DeviceUnavailable`
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn MicrophoneStream>>;
}

/// A live recording on an acquired device
pub trait MicrophoneStream: Send {
    /// Take everything recorded since the previous call
    ///
    /// Returns `None` when nothing new was recorded.
    fn take_chunk(&mut self) -> Option<Vec<u8>>;

    /// Stop recording and release the device; must be idempotent
    fn stop(&mut self);
}

/// Whether `start` opened a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Started,
    AlreadyActive,
}

/// Captures microphone audio and pushes it out in chunks
pub struct AudioCapture {
    microphone: Arc<dyn Microphone>,
    constraints: CaptureConstraints,
    chunk_interval: Duration,
    session: Option<CaptureSession>,
}

impl AudioCapture {
    /// Create a capture front-end for a microphone
    #[must_use]
    pub fn new(microphone: Arc<dyn Microphone>, config: CaptureConfig) -> Self {
        Self {
            microphone,
            constraints: CaptureConstraints {
                sample_rate: config.sample_rate,
                ..CaptureConstraints::default()
            },
            chunk_interval: config.chunk_interval,
            session: None,
        }
    }

    /// Acquire the microphone and start pushing chunks into `sink`
    ///
    /// A second call while a session is active is a no-op and the new sink
    /// is dropped. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` or `Error::DeviceUnavailable`;
    /// neither is retried here.
    pub fn start(&mut self, sink: mpsc::Sender<AudioChunk>) -> Result<CaptureStatus> {
        if self.session.is_some() {
            return Ok(CaptureStatus::AlreadyActive);
        }

        let stream = self.microphone.acquire(&self.constraints)?;
        let stream = Arc::new(Mutex::new(stream));
        let seq = Arc::new(AtomicU64::new(0));
        let ticker = tokio::spawn(pump(
            Arc::clone(&stream),
            sink.clone(),
            Arc::clone(&seq),
            self.chunk_interval,
        ));

        self.session = Some(CaptureSession {
            stream,
            sink,
            seq,
            ticker,
        });

        tracing::debug!(
            interval_ms = u64::try_from(self.chunk_interval.as_millis()).unwrap_or(u64::MAX),
            "audio capture started"
        );
        Ok(CaptureStatus::Started)
    }

    /// Stop capturing and release the device
    ///
    /// Any partially filled chunk is flushed to the sink first. Safe to call
    /// when not capturing.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("constraints", &self.constraints)
            .field("chunk_interval", &self.chunk_interval)
            .field("capturing", &self.is_capturing())
            .finish_non_exhaustive()
    }
}

/// Active capture; releasing it releases the device
struct CaptureSession {
    stream: Arc<Mutex<Box<dyn MicrophoneStream>>>,
    sink: mpsc::Sender<AudioChunk>,
    seq: Arc<AtomicU64>,
    ticker: JoinHandle<()>,
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.ticker.abort();

        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(data) = stream.take_chunk() {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            if self.sink.try_send(AudioChunk { seq, data }).is_err() {
                tracing::debug!("sink full or closed, final chunk dropped");
            }
        }
        stream.stop();
    }
}

/// Drain the stream into the sink every `interval`
async fn pump(
    stream: Arc<Mutex<Box<dyn MicrophoneStream>>>,
    sink: mpsc::Sender<AudioChunk>,
    seq: Arc<AtomicU64>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let data = {
            let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
            stream.take_chunk()
        };
        let Some(data) = data else {
            continue;
        };

        let seq = seq.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(seq, bytes = data.len(), "audio chunk captured");
        if sink.send(AudioChunk { seq, data }).await.is_err() {
            tracing::debug!("chunk sink closed, stopping pump");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct FakeMicrophone {
        deny: AtomicBool,
        acquired: AtomicUsize,
        released: Arc<AtomicUsize>,
        live: Arc<AtomicBool>,
    }

    struct FakeStream {
        counter: u8,
        released: Arc<AtomicUsize>,
        live: Arc<AtomicBool>,
        stopped: bool,
    }

    impl Microphone for FakeMicrophone {
        fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn MicrophoneStream>> {
            assert!(constraints.echo_cancellation);
            assert!(constraints.noise_suppression);
            assert!(constraints.auto_gain_control);

            if self.deny.load(Ordering::SeqCst) {
                return Err(Error::PermissionDenied("denied by user".to_string()));
            }
            assert!(!self.live.swap(true, Ordering::SeqCst), "device acquired twice");
            self.acquired.fetch_add(1, Ordering::SeqCst);

            Ok(Box::new(FakeStream {
                counter: 0,
                released: Arc::clone(&self.released),
                live: Arc::clone(&self.live),
                stopped: false,
            }))
        }
    }

    impl MicrophoneStream for FakeStream {
        fn take_chunk(&mut self) -> Option<Vec<u8>> {
            self.counter += 1;
            Some(vec![self.counter])
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.live.store(false, Ordering::SeqCst);
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn capture(mic: &Arc<FakeMicrophone>) -> AudioCapture {
        AudioCapture::new(Arc::clone(mic) as Arc<dyn Microphone>, CaptureConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn emits_chunks_on_cadence() {
        let mic = Arc::new(FakeMicrophone::default());
        let mut capture = capture(&mic);
        let (tx, mut rx) = mpsc::channel(8);

        assert_eq!(capture.start(tx).unwrap(), CaptureStatus::Started);

        let started = tokio::time::Instant::now();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn second_start_is_noop() {
        let mic = Arc::new(FakeMicrophone::default());
        let mut capture = capture(&mic);
        let (tx, _rx) = mpsc::channel(8);

        capture.start(tx.clone()).unwrap();
        assert_eq!(capture.start(tx).unwrap(), CaptureStatus::AlreadyActive);
        assert_eq!(mic.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_releases_and_flushes() {
        let mic = Arc::new(FakeMicrophone::default());
        let mut capture = capture(&mic);
        let (tx, mut rx) = mpsc::channel(8);

        capture.start(tx).unwrap();
        capture.stop();

        assert!(!capture.is_capturing());
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
        assert!(!mic.live.load(Ordering::SeqCst));
        assert!(rx.recv().await.is_some(), "partial chunk flushed on stop");
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let mic = Arc::new(FakeMicrophone::default());
        let mut capture = capture(&mic);

        let (tx, _rx) = mpsc::channel(8);
        capture.start(tx).unwrap();
        capture.stop();

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(capture.start(tx).unwrap(), CaptureStatus::Started);
        assert_eq!(mic.acquired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_releases_device() {
        let mic = Arc::new(FakeMicrophone::default());
        let (tx, _rx) = mpsc::channel(8);
        {
            let mut capture = capture(&mic);
            capture.start(tx).unwrap();
        }

        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permission_error_is_surfaced() {
        let mic = Arc::new(FakeMicrophone::default());
        mic.deny.store(true, Ordering::SeqCst);
        let mut capture = capture(&mic);
        let (tx, _rx) = mpsc::channel(8);

        let err = capture.start(tx).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert!(err.is_fatal());
        assert!(!capture.is_capturing());
    }
}
