//! Audio playback to speakers
//!
//! [`RemoteSpeechEngine`] asks the backend to synthesize speech, downloads
//! the MP3 it points at, and plays it on the default output device.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::speech::{SpeechEngine, SpeechRequest, Voice};
use crate::router::ApiClient;
use crate::{Error, Result};

/// How often the playback thread checks for completion or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Decoded mono audio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Scale every sample by `volume`
    pub fn apply_volume(&mut self, volume: f32) {
        if (volume - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in &mut self.samples {
            *sample *= volume;
        }
    }

    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let millis = (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate);
        Duration::from_millis(millis)
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns `Error::Synthesis` if the data is not MP3 or holds no audio
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut audio = DecodedAudio::default();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if audio.sample_rate == 0 {
                    audio.sample_rate = u32::try_from(frame.sample_rate).unwrap_or(24_000);
                }

                if frame.channels == 2 {
                    // Stereo: average channels
                    audio.samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    audio
                        .samples
                        .extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Synthesis(format!("MP3 decode error: {e}"))),
        }
    }

    if audio.samples.is_empty() {
        return Err(Error::Synthesis("no audio decoded".to_string()));
    }

    Ok(audio)
}

/// Play audio on the default output device, blocking until it ends
///
/// Returns early once `cancel` is set.
///
/// # Errors
///
/// Returns `Error::DeviceUnavailable` if no output device can play the audio
pub fn play_blocking(audio: &DecodedAudio, cancel: &AtomicBool) -> Result<()> {
    if audio.samples.is_empty() || cancel.load(Ordering::SeqCst) {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let rate = SampleRate(audio.sample_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };
    let config: StreamConfig = supports(1)
        .or_else(|| supports(2))
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?
        .with_sample_rate(rate)
        .config();

    let channels = usize::from(config.channels);
    let samples = audio.samples.clone();
    let mut position = 0usize;
    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or_else(|| {
                        finished_cb.store(true, Ordering::SeqCst);
                        0.0
                    });
                    frame.fill(sample);
                    position = position.saturating_add(1);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    let deadline = Instant::now() + audio.duration() + Duration::from_millis(500);
    while !finished.load(Ordering::SeqCst) && !cancel.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    drop(stream);
    if cancel.load(Ordering::SeqCst) {
        tracing::debug!("playback cancelled");
    } else {
        tracing::debug!(samples = audio.samples.len(), "playback complete");
    }

    Ok(())
}

/// Sets the flag when the owning future is dropped
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Speech engine backed by the API's `/tts` endpoint
///
/// Rate and pitch are chosen by the backend; only volume is applied
/// locally.
pub struct RemoteSpeechEngine {
    api: ApiClient,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl RemoteSpeechEngine {
    #[must_use]
    pub const fn new(api: ApiClient) -> Self {
        Self {
            api,
            current: Mutex::new(None),
        }
    }

    async fn fetch(&self, text: &str) -> Result<DecodedAudio> {
        let reply = self.api.tts(text).await?;
        tracing::debug!(
            audio_url = %reply.audio_url,
            duration = reply.duration,
            "speech synthesized"
        );

        let bytes = self.api.fetch_audio(&reply.audio_url).await?;
        decode_mp3(&bytes)
    }
}

impl std::fmt::Debug for RemoteSpeechEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSpeechEngine")
            .field("api", &self.api.base_url())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SpeechEngine for RemoteSpeechEngine {
    fn voices(&self) -> Vec<Voice> {
        vec![Voice::fallback()]
    }

    async fn speak(&self, request: &SpeechRequest) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&cancel));
        let _guard = CancelOnDrop(Arc::clone(&cancel));

        let mut audio = self.fetch(request.text()).await.map_err(|e| match e {
            Error::Synthesis(_) => e,
            other => Error::Synthesis(other.to_string()),
        })?;
        audio.apply_volume(request.volume());

        let flag = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || play_blocking(&audio, &flag))
            .await
            .map_err(|e| Error::Synthesis(format!("playback task failed: {e}")))?
    }

    fn stop(&self) {
        if let Some(cancel) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}
