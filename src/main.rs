use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voiceloop::capture::UnavailableEngine;
use voiceloop::segment::{finish_segment, segment_completed_sentences, tidy_sentence};
use voiceloop::synthesis::TtsRenderer;
use voiceloop::voice::{
    AudioPlayback, Microphone, MicrophoneEngine, SpeechToText, TextToSpeech, VolumeMeter, rms,
    tone,
};
use voiceloop::{
    Config, HttpBackend, Orchestrator, RecognitionEngine, SessionEvent, SessionHandle,
    SessionState, SynthesisQueue,
};

/// Voiceloop - talk to a streaming assistant and hear it answer
#[derive(Parser)]
#[command(name = "voiceloop", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Alternate config file
    #[arg(long, env = "VOICELOOP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the microphone level meter
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Play a test tone
    TestSpeaker,
    /// Speak text sentence by sentence
    Say {
        text: String,
    },
    /// Ask a typed question and hear the streamed reply
    Ask {
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voiceloop=info",
        1 => "info,voiceloop=debug",
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Command::TestMic { duration }) => test_mic(&config, duration).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Say { text }) => say(&config, &text).await,
        Some(Command::Ask { prompt }) => ask(config, &prompt).await,
        None => interactive(config).await,
    }
}

/// Print the level meter the capture engine reports
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = Microphone::open()?;
    let mut meter = VolumeMeter::new(config.capture.volume_smoothing);

    for tick in 0..duration * 10 {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let samples = microphone.take_samples();
        let level = meter.process(&samples);

        if tick % 5 == 4 {
            let bar = "█".repeat(usize::from(level / 2));
            #[allow(clippy::cast_precision_loss)]
            let seconds = (tick + 1) as f32 / 10.0;
            println!(
                "[{seconds:4.1}s] level {level:3} | RMS {:.4} | {bar}",
                rms(&samples)
            );
        }
    }

    println!("\n---");
    println!("If the level moved while you spoke, your mic is working!");
    Ok(())
}

async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;
    let started = playback.snapshot();
    tokio::task::spawn_blocking(move || playback.play_blocking(tone(440.0, 2.0, 0.3), started))
        .await??;

    println!("If you heard the tone, your speakers are working!");
    Ok(())
}

/// Speak `text` through the synthesis queue
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let queue = SynthesisQueue::new(Arc::new(build_renderer(config)?));

    let (mut units, rest) = segment_completed_sentences(text);
    units.extend(finish_segment(&rest));
    let units: Vec<String> = units
        .iter()
        .map(|u| tidy_sentence(u))
        .filter(|u| !u.trim().is_empty())
        .collect();

    println!("Speaking {} sentence(s)...", units.len());
    queue.enqueue_and_speak(units).await?;
    Ok(())
}

/// One typed turn: backend, segmentation, synthesis, no microphone
async fn ask(config: Config, prompt: &str) -> anyhow::Result<()> {
    let mut session = config.session.clone();
    session.continuous = false;

    let (handle, mut events) = Orchestrator::spawn(
        session,
        Box::new(UnavailableEngine),
        Arc::new(build_renderer(&config)?),
        Arc::new(build_backend(&config)),
    );

    handle.submit_text(prompt).await?;

    let mut state = handle.watch_state();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == SessionState::Idle {
                    break;
                }
            }
        }
    }

    let transcript = handle.end_session().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    println!("\n{}", transcript.to_text());
    Ok(())
}

/// Push-to-talk session: Enter starts a turn (or barges in), `q` quits
async fn interactive(config: Config) -> anyhow::Result<()> {
    config.validate_voice()?;

    let (handle, mut events) = Orchestrator::spawn(
        config.session.clone(),
        build_engine(&config)?,
        Arc::new(build_renderer(&config)?),
        Arc::new(build_backend(&config)),
    );

    println!("Press Enter to talk, Enter again to interrupt, q + Enter to quit.");

    let (line_tx, mut lines) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let SessionEvent::TranscriptReady(transcript) = &event {
                    // Session hit its time limit
                    println!("\n--- transcript ---\n{}", transcript.to_text());
                    return Ok(());
                }
                print_event(&event);
            }
            line = lines.recv() => match line.as_deref().map(str::trim) {
                Some("q" | "quit") | None => break,
                Some(_) => start_turn(&handle).await,
            },
        }
    }

    if handle.is_closed() {
        tracing::debug!("session already closed");
        return Ok(());
    }
    let transcript = handle.end_session().await.unwrap_or_default();
    if !transcript.is_empty() {
        println!("\n--- transcript ---\n{}", transcript.to_text());
    }
    Ok(())
}

async fn start_turn(handle: &SessionHandle) {
    if let Err(e) = handle.begin_turn().await {
        tracing::debug!(error = %e, "turn not started");
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => println!("[{state:?}]"),
        SessionEvent::InterimText(text) if !text.is_empty() => {
            print!("\r… {text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::TurnAppended(turn) => println!("{}: {}", turn.role, turn.content),
        SessionEvent::Error(message) => eprintln!("! {message}"),
        SessionEvent::InterimText(_) | SessionEvent::Volume(_) | SessionEvent::TranscriptReady(_) => {}
    }
}

fn build_renderer(config: &Config) -> anyhow::Result<TtsRenderer> {
    let tts = TextToSpeech::new(
        config.voice.tts_provider,
        config.tts_key().unwrap_or_default().to_string(),
        config.voice.tts_model.clone(),
        config.voice.tts_voice.clone(),
        config.voice.tts_speed,
    )?;
    Ok(TtsRenderer::new(tts, AudioPlayback::new()?))
}

fn build_engine(config: &Config) -> anyhow::Result<Box<dyn RecognitionEngine>> {
    let stt = SpeechToText::new(
        config.voice.stt_provider,
        config.stt_key().unwrap_or_default().to_string(),
        config.voice.stt_model.clone(),
        config.voice.language.clone(),
    )?;
    Ok(Box::new(MicrophoneEngine::new(
        stt,
        tokio::runtime::Handle::current(),
        config.capture.no_speech_timeout,
        config.capture.volume_smoothing,
    )))
}

fn build_backend(config: &Config) -> HttpBackend {
    HttpBackend::new(
        config.backend.url.clone(),
        config.backend.api_key.clone(),
        config.backend.request_timeout,
    )
}
