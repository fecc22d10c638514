use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearsay::audio::{calculate_rms, downmix_to_mono, pcm16_to_f32, pcm16_to_wav, read_wav_pcm16};
use hearsay::frames::Message;
use hearsay::services::openai::OpenAiClient;
use hearsay::services::pocket_tts::PocketTtsClient;
use hearsay::services::vosk::{VoskConnection, VoskResult};
use hearsay::transport::{self, AudioCapture, AudioPlayback};
use hearsay::Config;

/// Hearsay - conversational voice bot over local STT, LLM and TTS services
#[derive(Parser)]
#[command(name = "hearsay", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/hearsay/config.toml)
    #[arg(short, long, env = "HEARSAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Serve bot sessions to WebSocket clients (default)
    Serve {
        /// Port to listen on, overriding the config
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to the bot through the local microphone and speaker
    Local,
    /// Transcribe a WAV file with the speech recognition server
    CheckStt {
        /// 16-bit mono WAV file
        file: PathBuf,
    },
    /// Stream one completion from the language model
    CheckLlm {
        #[arg(default_value = "Say hello in one short sentence.")]
        prompt: String,
    },
    /// Synthesize text with the speech server
    CheckTts {
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Write a WAV file instead of playing the audio
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hearsay=info",
        1 => "info,hearsay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
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
    let command = cli.command.unwrap_or(Command::Serve { port: None });

    // Device diagnostics work without a config
    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker(),
        _ => {}
    }

    let mut config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(
                stt = %config.stt.uri,
                llm = %config.llm.base_url,
                model = %config.llm.model,
                tts = %config.tts.base_url,
                "starting hearsay"
            );
            transport::serve(config).await?;
        }
        Command::Local => {
            let outcome = transport::run_local(&config).await?;
            tracing::info!(?outcome, "local session ended");
        }
        Command::CheckStt { file } => check_stt(&config, &file).await?,
        Command::CheckLlm { prompt } => check_llm(&config, &prompt).await?,
        Command::CheckTts { text, out } => check_tts(&config, &text, out.as_deref()).await?,
        Command::TestMic { .. } | Command::TestSpeaker => {}
    }

    Ok(())
}

/// Stream a WAV file to Vosk and print what it hears
async fn check_stt(config: &Config, file: &Path) -> anyhow::Result<()> {
    let (pcm, sample_rate, channels) = read_wav_pcm16(file)?;
    if channels != 1 {
        anyhow::bail!("{}: expected mono audio, got {channels} channels", file.display());
    }

    println!(
        "Transcribing {} ({sample_rate} Hz) with {}...",
        file.display(),
        config.stt.uri
    );

    let mut connection = VoskConnection::connect(&config.stt.uri, sample_rate).await?;

    // 200ms per message
    let chunk = usize::try_from(sample_rate / 5).unwrap_or(3200) * 2;
    for part in pcm.chunks(chunk.max(2)) {
        connection.send_audio(part.to_vec().into()).await?;
    }
    connection.send_eof().await?;

    let mut heard = false;
    while let Some(result) = connection.next_result().await? {
        match result {
            VoskResult::Partial(text) => println!("  ... {text}"),
            VoskResult::Final(text) => {
                heard = true;
                println!("> {text}");
            }
        }
    }

    if !heard {
        println!("No speech recognized.");
    }
    Ok(())
}

/// Stream one completion and print it as it arrives
async fn check_llm(config: &Config, prompt: &str) -> anyhow::Result<()> {
    let client = OpenAiClient::new(config.llm_params());
    println!("Asking {} at {}...\n", config.llm.model, config.llm.base_url);

    let messages = [
        Message::system(config.llm.system_prompt.clone()),
        Message::user(prompt),
    ];
    let reply = client
        .complete(&messages, |text| {
            print!("{text}");
            let _ = std::io::stdout().flush();
        })
        .await?;

    println!("\n\n---");
    println!("{} characters received", reply.chars().count());
    Ok(())
}

/// Synthesize text and play it or write it to a WAV file
async fn check_tts(config: &Config, text: &str, out: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let client = PocketTtsClient::new(config.tts_params());
    let audio = client.synthesize(text).await?;
    println!(
        "Got {:.2}s of audio at {} Hz",
        audio.duration().as_secs_f32(),
        audio.sample_rate
    );

    if let Some(path) = out {
        let wav = pcm16_to_wav(&audio.audio, audio.sample_rate, audio.num_channels)?;
        std::fs::write(path, wav)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let samples = downmix_to_mono(&pcm16_to_f32(&audio.audio), audio.num_channels);

    println!("Playing audio...");
    let sample_rate = audio.sample_rate;
    tokio::task::spawn_blocking(move || AudioPlayback::new(sample_rate)?.play(samples)).await??;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(16_000)?;
    capture.start()?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        capture.clear_buffer();
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u16;
    let playback = AudioPlayback::new(u32::from(sample_rate))?;

    let frequency = 440.0_f32;
    let num_samples = u32::from(sample_rate) * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / f32::from(sample_rate);
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    playback.play(samples)?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}
