//! Default input device via cpal

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleRate, Stream, StreamConfig};

use super::capture::{CaptureConstraints, Microphone, MicrophoneStream};
use crate::{Error, Result};

/// Default input device of the platform's default host
///
/// cpal has no portable switch for echo cancellation, noise suppression or
/// gain control; whatever the OS applies to the default device is used, and
/// the constraints are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn MicrophoneStream>> {
        let sample_rate = constraints.sample_rate;
        let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        tracing::debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            sample_rate,
            "acquiring microphone"
        );

        // cpal streams are not Send; the stream lives and dies on this thread
        let thread_buffer = Arc::clone(&buffer);
        let thread = std::thread::Builder::new()
            .name("aura-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(sample_rate, thread_buffer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blocks until stop() sends or the stream handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("microphone released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::DeviceUnavailable(
                    "capture thread exited during startup".to_string(),
                ));
            }
        }

        Ok(Box::new(CpalStream {
            buffer,
            sample_rate,
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// Live recording on the default input device
struct CpalStream {
    buffer: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneStream for CpalStream {
    fn take_chunk(&mut self) -> Option<Vec<u8>> {
        let samples = self
            .buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();

        if samples.is_empty() {
            return None;
        }

        match samples_to_wav(&samples, self.sample_rate) {
            Ok(wav) => Some(wav),
            Err(e) => {
                tracing::warn!(error = %e, samples = samples.len(), "failed to frame chunk");
                None
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(sample_rate: u32, buffer: Arc<Mutex<Vec<f32>>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(classify_build_error)?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

/// Map a cpal stream error onto the capture taxonomy
fn classify_build_error(err: BuildStreamError) -> Error {
    let message = err.to_string();
    if message.to_lowercase().contains("permission") {
        Error::PermissionDenied(message)
    } else {
        Error::DeviceUnavailable(message)
    }
}

/// Frame f32 samples as a mono 16-bit WAV chunk
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
