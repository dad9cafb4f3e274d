use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use aura_client::voice::{
    AudioCapture, CpalMicrophone, RemoteSpeechEngine, SpeechEvent, SpeechOutcome, SpeechQueue,
    SpeechRequest,
};
use aura_client::{ApiClient, AssistantEvent, ChatOptions, Config, VoiceClient};

/// Aura - voice and chat client for the Aura assistant
#[derive(Parser)]
#[command(name = "aura", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// API base URL (overrides config)
    #[arg(long, env = "AURA_API_URL")]
    api_url: Option<String>,

    /// Transcription WebSocket URL (overrides config)
    #[arg(long, env = "AURA_WS_URL")]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream the microphone to the transcription service and print transcripts
    Listen {
        /// Stop after this many seconds; runs until Ctrl-C if omitted
        #[arg(short, long)]
        duration: Option<u64>,
        /// Send each transcript to the assistant and speak the reply
        #[arg(long)]
        respond: bool,
    },
    /// Chat with the assistant; reads lines from stdin when no message is given
    Chat {
        /// Message to send
        message: Option<String>,
        /// Speak replies aloud
        #[arg(short, long)]
        speak: bool,
        /// System message for the session path
        #[arg(long)]
        system: Option<String>,
        /// Probe the session path before chatting
        #[arg(long)]
        check: bool,
    },
    /// Speak text through the remote speech engine
    Speak {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Playback volume (0.0 - 1.0)
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Show backend and session path status
    Status,
    /// Run an assistant command
    Execute {
        /// Command text
        command: String,
        /// Route through the desktop assistant
        #[arg(long)]
        jarvis: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,aura_client=info",
        1 => "info,aura_client=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        api_url,
        ws_url,
        command,
        ..
    } = cli;
    let config = Config::load_with(|config| {
        if let Some(url) = api_url {
            config.api_base_url = url;
        }
        if let Some(url) = ws_url {
            config.transcription_url = url;
        }
    })?;

    match command {
        Command::Listen { duration, respond } => listen(config, duration, respond).await,
        Command::Chat {
            message,
            speak,
            system,
            check,
        } => chat(config, message, speak, system, check).await,
        Command::Speak { text, volume } => speak(&config, &text, volume).await,
        Command::Status => status(config).await,
        Command::Execute { command, jarvis } => execute(&config, &command, jarvis).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
    }
}

async fn listen(config: Config, duration: Option<u64>, respond: bool) -> anyhow::Result<()> {
    let (mut client, mut events) = VoiceClient::builder(config).build()?;
    client.start_listening().await?;

    println!("Listening... (Ctrl-C to stop)");

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    AssistantEvent::Transcript(text) => {
                        println!("you: {text}");
                        if respond {
                            match client.send_message(&text, &ChatOptions::default(), true).await {
                                Ok(reply) => println!("aura ({}): {}", reply.route, reply.text),
                                Err(e) => eprintln!("error: {e}"),
                            }
                        }
                    }
                    AssistantEvent::Error(e) if e.is_fatal() => {
                        client.stop_listening().await;
                        return Err(e.into());
                    }
                    AssistantEvent::Error(e) => eprintln!("error: {e}"),
                    AssistantEvent::Connection(state) => tracing::info!(?state, "connection"),
                    AssistantEvent::Speech(_) => {}
                }
            }
        }
    }

    client.stop_listening().await;
    println!("Stopped.");
    Ok(())
}

async fn chat(
    config: Config,
    message: Option<String>,
    speak: bool,
    system: Option<String>,
    check: bool,
) -> anyhow::Result<()> {
    let (client, mut events) = VoiceClient::builder(config).build()?;
    let options = ChatOptions {
        system_message: system,
        ..ChatOptions::default()
    };

    if check {
        match client.check_availability().await {
            Ok(()) => println!("Session path available"),
            Err(e) => println!("Using stateless API ({e})"),
        }
    }

    if let Some(message) = message {
        let reply = client.send_message(&message, &options, speak).await?;
        println!("{}", reply.text);
        if speak {
            wait_for_speech(&mut events).await;
        }
        return Ok(());
    }

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match client.send_message(line, &options, speak).await {
            Ok(reply) => {
                println!("aura ({}): {}", reply.route, reply.text);
                if speak {
                    wait_for_speech(&mut events).await;
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}

/// Block until the utterance queued by a reply has finished
async fn wait_for_speech(events: &mut mpsc::UnboundedReceiver<AssistantEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AssistantEvent::Speech(SpeechEvent::Finished { .. }) => break,
            AssistantEvent::Speech(SpeechEvent::Failed { error, .. }) => {
                eprintln!("speech failed: {error}");
                break;
            }
            _ => {}
        }
    }
}

async fn speak(config: &Config, text: &str, volume: Option<f32>) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.api_base_url)?;
    let queue = SpeechQueue::spawn(Arc::new(RemoteSpeechEngine::new(api)));

    let mut request = SpeechRequest::from_config(text, &config.speech);
    if let Some(volume) = volume {
        request = request.with_volume(volume);
    }

    println!("Speaking: \"{text}\"");
    match queue.speak(request).await? {
        SpeechOutcome::Completed => println!("Done."),
        SpeechOutcome::Cancelled => println!("Cancelled."),
    }
    Ok(())
}

async fn status(config: Config) -> anyhow::Result<()> {
    let (client, _events) = VoiceClient::builder(config).build()?;

    let status = client.status().await?;
    println!(
        "Backend: {} ({})",
        if status.online { "online" } else { "offline" },
        status.status
    );
    if let Some(model) = status.model {
        println!("Model: {model}");
    }

    match client.check_availability().await {
        Ok(()) => println!("Session path: available"),
        Err(e) => println!("Session path: unavailable ({e})"),
    }
    Ok(())
}

async fn execute(config: &Config, command: &str, jarvis: bool) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.api_base_url)?;
    let result = api.execute(command, jarvis).await?;

    if result.success {
        println!("{}", result.message);
    } else {
        eprintln!("failed: {}", result.message);
    }
    if let Some(output) = result.result {
        println!("{output}");
    }
    Ok(())
}

async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(Arc::new(CpalMicrophone), config.capture);
    let (sink, mut chunks) = mpsc::channel(8);
    capture.start(sink)?;

    println!("Sample rate: {} Hz", config.capture.sample_rate);
    println!("---");

    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                let samples = wav_samples(&chunk.data)?;
                let energy = calculate_rms(&samples);
                let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

                println!(
                    "[{:3}] RMS: {:.4} | Peak: {:.4} | [{}]",
                    chunk.seq, energy, peak, meter
                );
            }
        }
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Read a captured WAV chunk back into f32 samples
fn wav_samples(wav: &[u8]) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(wav))?;
    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f32::from(v) / 32768.0))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
