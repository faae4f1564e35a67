use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voice_guide::voice::{
    AudioSegment, CaptureConstraints, CpalMicrophone, CpalOutput, GeminiSpeech, Microphone,
    OutputDevice, PlaybackScheduler, SEGMENT_SAMPLE_RATE, SpeechChunker, TtsQueue,
    samples_to_pcm_bytes, samples_to_wav,
};
use voice_guide::{ChatPart, ChatSession, Config, GeminiChat, GeminiClient, Role, Transcript};

/// Voice Guide - Real-time voice pipeline for a virtual tour guide
#[derive(Parser)]
#[command(name = "voice-guide", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input through the capture pipeline
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as a WAV file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
    /// Speak text through the TTS queue
    Speak {
        /// Text to speak
        #[arg(default_value = "Xin chào! Welcome to the old quarter. Shall we start the tour?")]
        text: String,
    },
    /// Ask the guide something and hear the reply
    Chat {
        /// Message to send
        message: String,
        /// Print the reply without speaking it
        #[arg(long)]
        mute: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_guide=info",
        1 => "info,voice_guide=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::TestMic { duration, record } => test_mic(duration, record.as_deref()).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Speak { text } => speak(&text).await,
        Command::Chat { message, mute } => chat(message, mute).await,
    }
}

/// Test microphone input
async fn test_mic(duration: u64, record: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CpalMicrophone
        .acquire(&CaptureConstraints::speech())
        .await?;
    let source_rate = capture.source_rate;
    println!("Sample rate: {source_rate} Hz");
    println!("---");

    let mut recorded = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut index = 0usize;

    while let Ok(Some(window)) = tokio::time::timeout_at(deadline, capture.windows.recv()).await {
        index += 1;
        let energy = calculate_rms(&window);
        let peak = window.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!("[{index:3}] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");

        if record.is_some() {
            recorded.extend_from_slice(&window);
        }
    }

    if let Err(e) = capture.handle.stop_tracks() {
        tracing::warn!(error = %e, "failed to stop microphone");
    }
    capture.handle.close()?;

    if let Some(path) = record {
        let wav = samples_to_wav(&recorded, source_rate)?;
        std::fs::write(path, wav).with_context(|| format!("writing {}", path.display()))?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If no windows arrived or RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
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

/// Test speaker output with a tone split into back-to-back segments
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear one unbroken 440Hz tone for about 2 seconds\n");

    let output = Arc::new(CpalOutput::open()?);
    println!("Device rate: {} Hz", output.sample_rate());
    let scheduler = PlaybackScheduler::new(output.clone());

    let frequency = 440.0_f32;
    let segment_len = SEGMENT_SAMPLE_RATE as usize * 2 / 3;
    for segment in 0..3 {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (segment * segment_len..(segment + 1) * segment_len)
            .map(|i| {
                let t = i as f32 / SEGMENT_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        scheduler.enqueue(AudioSegment::new(samples_to_pcm_bytes(&samples), None));
    }

    wait_for_playback(&scheduler, None).await;
    output.suspend();

    println!("\n---");
    println!("If you heard the tone without clicks or gaps, playback scheduling works!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

fn gemini_client(config: &Config) -> anyhow::Result<GeminiClient> {
    let key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY is not set (or [gemini] api_key in the config file)")?;
    Ok(GeminiClient::new(key, config.gemini_base_url.clone())?)
}

fn speech_pipeline(
    config: &Config,
    client: GeminiClient,
) -> anyhow::Result<(PlaybackScheduler, TtsQueue)> {
    let output: Arc<dyn OutputDevice> = Arc::new(CpalOutput::open()?);
    let scheduler = PlaybackScheduler::new(output);
    scheduler.set_output_enabled(config.playback_enabled);

    let synthesizer = GeminiSpeech::new(client, config.tts_model.clone(), config.tts_voice.clone());
    let tts = TtsQueue::new(Arc::new(synthesizer), scheduler.clone());
    Ok((scheduler, tts))
}

/// Speak text through the chunker and TTS queue
async fn speak(text: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let client = gemini_client(&config)?;
    let (scheduler, tts) = speech_pipeline(&config, client)?;

    let transcript = Transcript::shared();
    let origin = transcript
        .lock()
        .map_err(|_| anyhow::anyhow!("transcript lock poisoned"))?
        .push(Role::Model, text);

    let mut chunker = SpeechChunker::new();
    for word in text.split_inclusive(' ') {
        if let Some(chunk) = chunker.push(word) {
            println!("> {chunk}");
            tts.submit(chunk, origin);
        }
    }
    if let Some(chunk) = chunker.finish() {
        println!("> {chunk}");
        tts.submit(chunk, origin);
    }

    wait_for_playback(&scheduler, Some(&tts)).await;
    Ok(())
}

/// Send one chat message and speak the streamed reply
async fn chat(message: String, mute: bool) -> anyhow::Result<()> {
    let config = Config::load();
    let client = gemini_client(&config)?;
    let (scheduler, tts) = speech_pipeline(&config, client.clone())?;
    if mute {
        scheduler.set_output_enabled(false);
    }

    let generator = GeminiChat::new(
        client,
        config.chat_model.clone(),
        Some(config.system_prompt.clone()),
    );
    let mut session = ChatSession::new(Arc::new(generator), tts.clone(), Transcript::shared());

    session
        .send(vec![ChatPart::Text(message)], |fragment| {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        })
        .await?;
    println!();

    if mute {
        tts.cancel_pending();
    } else {
        wait_for_playback(&scheduler, Some(&tts)).await;
    }
    Ok(())
}

/// Wait until queued speech has been synthesized and played
async fn wait_for_playback(scheduler: &PlaybackScheduler, tts: Option<&TtsQueue>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let synthesizing = tts.is_some_and(|tts| !tts.is_idle());
        // Muted output never drains its queue
        let drained = scheduler.is_idle() || !scheduler.is_output_enabled();
        if !synthesizing && drained {
            return;
        }
    }
}
