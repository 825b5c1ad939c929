use anyhow::anyhow;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use whisperline_app::runtime::TranscriptionPipeline;
use whisperline_app::settings::Settings;
use whisperline_foundation::AppError;
use whisperline_stt::ProviderType;

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "whisperline.log");
    let (non_blocking_file, _guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    std::mem::forget(_guard);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    tracing::info!("Starting Whisperline");

    let settings = Settings::new().map_err(|e| anyhow!(e))?;
    let mut pipeline = TranscriptionPipeline::from_settings(&settings);

    println!("Whisperline push-to-talk transcription");
    println!(
        "Backend: {} ({}). Type 'help' for commands.",
        pipeline.provider(),
        pipeline.config().model
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_command(&mut pipeline, line.trim()).await {
                            break;
                        }
                    }
                    // stdin closed
                    None => break,
                }
            }
        }
    }

    // Stop any recording still in flight so the transcript is not lost.
    if pipeline.is_recording() {
        pipeline.stop().await?;
        let transcript = pipeline.transcript();
        if !transcript.is_empty() {
            println!("{transcript}");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run one REPL command. Returns `false` when the user asked to quit.
async fn handle_command(pipeline: &mut TranscriptionPipeline, line: &str) -> bool {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "start" => match pipeline.start() {
            Ok(()) => println!("Recording. Type 'stop' to finish."),
            Err(e) => println!("Cannot start: {e}"),
        },
        "stop" => match pipeline.stop().await {
            Ok(()) => {
                let transcript = pipeline.transcript();
                if transcript.is_empty() {
                    match pipeline.last_error() {
                        Some(err) => println!("No transcript: {err}"),
                        None => println!("No speech captured."),
                    }
                } else {
                    println!("{transcript}");
                }
            }
            Err(e) => println!("Stop failed: {e}"),
        },
        "text" => println!("{}", pipeline.transcript()),
        "status" => {
            println!("State:        {:?}", pipeline.state());
            println!(
                "Backend:      {} ({})",
                pipeline.provider(),
                pipeline.config().model
            );
            println!("Transcribing: {}", pipeline.is_transcribing());
            println!("Input level:  {:.2}", pipeline.audio_level());
            if let Some(err) = pipeline.last_error() {
                println!("Last error:   {err}");
            }
        }
        "devices" => match pipeline.list_devices() {
            Ok(devices) if devices.is_empty() => println!("No input devices found."),
            Ok(devices) => {
                for device in devices {
                    let marker = if device.is_default { " (default)" } else { "" };
                    println!("  {}{}", device.name, marker);
                }
            }
            Err(e) => println!("Cannot enumerate devices: {e}"),
        },
        "device" => {
            let device = (!rest.is_empty()).then(|| rest.to_string());
            report(pipeline.set_device(device));
        }
        "provider" => match rest.parse::<ProviderType>() {
            Ok(provider) => {
                report(pipeline.set_provider(provider));
                println!(
                    "Backend: {} ({})",
                    pipeline.provider(),
                    pipeline.config().model
                );
            }
            Err(_) => println!("Unknown provider '{rest}'. Choose openai, groq or deepgram."),
        },
        "model" => report(pipeline.set_model(rest)),
        "key" => report(pipeline.set_api_key(rest)),
        "language" => {
            let language = (!rest.is_empty()).then(|| rest.to_string());
            report(pipeline.set_language(language));
        }
        "partials" => match rest {
            "on" => report(pipeline.set_partial_results(true)),
            "off" => report(pipeline.set_partial_results(false)),
            _ => println!("Usage: partials on|off"),
        },
        "help" => print_help(),
        "quit" | "exit" => return false,
        other => println!("Unknown command '{other}'. Type 'help'."),
    }
    true
}

fn report(result: Result<(), AppError>) {
    if let Err(e) = result {
        println!("{e}");
    }
}

fn print_help() {
    println!("Commands:");
    println!("  start            begin recording");
    println!("  stop             finish recording and print the transcript");
    println!("  text             print the current transcript");
    println!("  status           pipeline state, backend and input level");
    println!("  devices          list input devices");
    println!("  device [name]    select an input device (blank = default)");
    println!("  provider <name>  switch backend: openai, groq, deepgram");
    println!("  model <id>       select a model on the current backend");
    println!("  key <api-key>    set the API key for the current backend");
    println!("  language [code]  ISO-639-1 hint, blank to clear");
    println!("  partials on|off  live partial display (realtime models)");
    println!("  quit             exit");
}
