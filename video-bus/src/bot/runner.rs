use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

use crate::bot::{BotDescriptor, RunBot};
use crate::bus::{
    Client, ClientFactory, ErrorCallbacks, IoHandle, IoLoop, ResilientClient,
    ThreadCheckingClient,
};
use crate::data::BotInput;
use crate::sink::MessageSink;
use crate::source::{av_source, bus_source, control_source, AvInput};
use crate::streams::publishers;
use crate::video::decode;

#[derive(Debug, Clone)]
pub enum VideoOrigin {
    /// Live stream from the bus channel named in [`RunnerOptions::channel`].
    Bus,
    /// File, URL or camera input; analysis output still goes to the bus.
    Av(AvInput),
}

pub struct RunnerOptions {
    pub bot_id: String,
    /// Base channel: frames on `<channel>`, metadata on `<channel>/metadata`,
    /// control in on `<channel>/control`, messages out on
    /// `<channel>/analysis`, `/debug` and `/control`.
    pub channel: String,
    pub origin: VideoOrigin,
    pub config: Option<serde_json::Value>,
}

struct FatalCallbacks {
    io: IoHandle,
}

impl ErrorCallbacks for FatalCallbacks {
    fn on_error(&self, error: crate::bus::ClientError) {
        log::error!("fatal bus client error: {}", error);
        self.io.stop();
    }
}

/// Runs a bot until its stream ends or a termination signal arrives: builds
/// the resilient client, dispatches the configure command, then drives
/// `source -> worker -> decode -> batches -> bot -> message sink` from the
/// io loop on the calling thread. The shutdown burst is drained before this
/// returns.
pub fn run_bot(
    descriptor: BotDescriptor,
    options: RunnerOptions,
    factory: ClientFactory,
) -> anyhow::Result<()> {
    let io = IoLoop::new();
    let error_callbacks: Arc<dyn ErrorCallbacks> = Arc::new(FatalCallbacks { io: io.handle() });

    let resilient = ResilientClient::new(io.handle(), factory, &error_callbacks)
        .map_err(|e| anyhow::anyhow!("creating bus client: {}", e))?;
    let client: Arc<dyn Client> = Arc::new(ThreadCheckingClient::new(io.handle(), resilient));
    client
        .start()
        .map_err(|e| anyhow::anyhow!("starting bus client: {}", e))?;

    let mut bot = RunBot::new(&options.bot_id, descriptor);
    bot.configure(options.config.clone());
    let pixel_format = bot.pixel_format();

    let encoded = match &options.origin {
        VideoOrigin::Bus => bus_source(client.clone(), &options.channel, None),
        VideoOrigin::Av(input) => av_source(input.clone()),
    };
    let decoded = decode(
        encoded
            .threaded_worker(format!("in_{}", options.channel))
            .flatten(),
        pixel_format,
    );
    let frames = decoded
        .threaded_worker(format!("frames_{}", options.channel))
        .map(BotInput::Frames);
    let control = control_source(client.clone(), &format!("{}/control", options.channel))
        .map(BotInput::Control);

    let inputs =
        publishers::merge(vec![frames, control]).signal_breaker(&[SIGINT, SIGTERM, SIGQUIT]);

    let done_io = io.handle();
    let done_client = client.clone();
    bot.run(inputs).subscribe(MessageSink::new(
        client.clone(),
        &options.channel,
        Box::new(move || {
            if let Err(e) = done_client.stop() {
                log::error!("error stopping bus client: {}", e);
            }
            done_io.stop();
        }),
    ));

    log::info!("starting bot {} on {}", options.bot_id, options.channel);
    let executed = io.run();
    log::info!("bot stopped, executed {} io tasks", executed);
    Ok(())
}
