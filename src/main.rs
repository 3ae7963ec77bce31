use std::sync::mpsc;

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use video_bus::data::PixelFormat;
use video_bus::sink::ContainerSink;
use video_bus::source::{av_source, AvInput};
use video_bus::video::{decode, encode_vp9};

/// Recorder: reads an encoded stream and persists it to a Matroska file.
/// Configured through the environment (no CLI framework):
///
///   VBOT_INPUT_FILE / VBOT_INPUT_URL / VBOT_INPUT_CAMERA  input origin
///   VBOT_CAMERA_FORMAT    input format for the camera (default "v4l2")
///   VBOT_LOOP=1           loop a file input
///   VBOT_OUTPUT_DIR       where the .mkv lands (default ".")
///   VBOT_TRANSCODE=1      decode and re-encode to VP9 instead of copying
///   VBOT_VP9_LAG          lag-in-frames for the transcode (default 25)
fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("video_bus", log::LevelFilter::Debug)
        .init();
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v == "true").unwrap_or(false)
}

fn input_from_env() -> anyhow::Result<(AvInput, String)> {
    if let Ok(path) = std::env::var("VBOT_INPUT_FILE") {
        let name = path.clone();
        return Ok((
            AvInput::File {
                path,
                loop_file: env_flag("VBOT_LOOP"),
            },
            name,
        ));
    }
    if let Ok(url) = std::env::var("VBOT_INPUT_URL") {
        let name = url.clone();
        return Ok((AvInput::Url { url }, name));
    }
    if let Ok(device) = std::env::var("VBOT_INPUT_CAMERA") {
        let format = std::env::var("VBOT_CAMERA_FORMAT").unwrap_or_else(|_| "v4l2".to_string());
        let name = device.clone();
        return Ok((AvInput::Camera { device, format }, name));
    }
    anyhow::bail!("no input: set VBOT_INPUT_FILE, VBOT_INPUT_URL or VBOT_INPUT_CAMERA")
}

fn escape_slashes(s: &str) -> String {
    s.replace('/', "{slash}")
}

fn output_path(input_name: &str) -> String {
    let dir = std::env::var("VBOT_OUTPUT_DIR").unwrap_or_else(|_| ".".to_string());
    format!("{}/{}.mkv", dir, escape_slashes(input_name))
}

fn run() -> anyhow::Result<()> {
    video_bus::init()?;

    let (input, input_name) = input_from_env()?;
    let output = output_path(&input_name);
    log::info!("recording {} to {}", input_name, output);

    let encoded = av_source(input)
        .threaded_worker(format!("in_{}", escape_slashes(&input_name)))
        .flatten();

    let stream = if env_flag("VBOT_TRANSCODE") {
        log::info!("using transcoded stream");
        let lag = std::env::var("VBOT_VP9_LAG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(25);
        let vp9 = encode_vp9(decode(encoded, PixelFormat::Rgb0), lag);
        vp9.threaded_worker("vp9").flatten()
    } else {
        log::info!("using original encoded stream");
        encoded
    };

    let (done_tx, done_rx) = mpsc::channel();
    stream
        .signal_breaker(&[SIGINT, SIGTERM, SIGQUIT])
        .subscribe(ContainerSink::new(
            &output,
            Box::new(move || {
                let _ = done_tx.send(());
            }),
        ));

    log::info!("starting recorder...");
    done_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("recorder pipeline dropped without finishing"))?;
    log::info!("recorder is stopped");
    Ok(())
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        log::error!("recorder failed: {:#}", e);
        std::process::exit(1);
    }
}
