//! Raiju air unit binary
//!
//! Brings the wireless link up in monitor mode, starts the video
//! pipeline and streams frame-fragment groups to the FEC transmitter.
//! Runs until interrupted, printing debug snapshots and health-checking
//! the pipeline once per second.
//!
//! ## Usage
//!
//! ```bash
//! # Interface and RF configuration
//! export RAIJU_WLAN=wlan1
//! export RAIJU_FREQ_MHZ=5745
//!
//! # Run (typically as root, the interface takeover shells out to
//! # nmcli/rfkill/ip/iw)
//! raiju-air
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use raiju_capture::{GstLaunchEngine, StreamConfig, VideoCodec, VideoStream};
use raiju_core::RadioParams;
use raiju_link::{LinkConfig, RadiotapParams, TransmitterOptions, WirelessLink};
use tracing::{info, warn};

/// Air unit configuration from environment variables.
struct Config {
    link: LinkConfig,
    stream: StreamConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    fn from_env() -> Result<Self> {
        let wlan = std::env::var("RAIJU_WLAN").unwrap_or_else(|_| "wlan0".to_string());

        // Extra receive-only cards, comma separated
        let mut interfaces = vec![wlan];
        if let Ok(extra) = std::env::var("RAIJU_EXTRA_WLANS") {
            interfaces.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        let mut radio = RadioParams::default();
        if let Some(freq) = env_parse("RAIJU_FREQ_MHZ") {
            radio.frequency_mhz = freq;
        }
        if let Some(width) = env_parse("RAIJU_WIDTH_MHZ") {
            radio.channel_width_mhz = width;
        }
        if let Some(mbm) = env_parse("RAIJU_TX_POWER_MBM") {
            radio.tx_power_mbm = mbm;
        }
        if let Some(index) = env_parse("RAIJU_TX_POWER_INDEX") {
            radio.tx_power_index = index;
        }
        if let Some(mcs) = env_parse("RAIJU_MCS") {
            radio.mcs_index = mcs;
        }

        let radiotap = RadiotapParams {
            mcs_index: radio.mcs_index,
            bandwidth_mhz: radio.channel_width_mhz,
            ..Default::default()
        };

        let mut options = TransmitterOptions::default();
        if let Some(port) = env_parse("RAIJU_RADIO_PORT") {
            options.radio_port = port;
        }
        if let Some(pct) = env_parse("RAIJU_FEC_PERCENT") {
            options.fec_overhead_percentage = pct;
        }
        if let Some(k) = env_parse("RAIJU_FEC_K") {
            options.fixed_k = k;
        }
        if let Some(port) = env_parse("RAIJU_ENCODER_PORT") {
            options.encoder_port = port;
        }

        let mut stream = StreamConfig::default();
        if let Ok(device) = std::env::var("RAIJU_DEVICE") {
            stream.device = device;
        }
        if let Some(width) = env_parse("RAIJU_WIDTH") {
            stream.width = width;
        }
        if let Some(height) = env_parse("RAIJU_HEIGHT") {
            stream.height = height;
        }
        if let Some(fps) = env_parse("RAIJU_FPS") {
            stream.fps = fps;
        }
        if let Some(bitrate) = env_parse("RAIJU_BITRATE_BPS") {
            stream.bitrate_bps = bitrate;
        }
        if let Ok(codec) = std::env::var("RAIJU_CODEC") {
            stream.codec = match codec.to_ascii_lowercase().as_str() {
                "h264" => VideoCodec::H264,
                "h265" | "hevc" => VideoCodec::H265,
                other => {
                    warn!("unknown codec '{}', using h265", other);
                    VideoCodec::H265
                }
            };
        }

        Ok(Self {
            link: LinkConfig {
                interfaces,
                radio,
                radiotap,
                options,
            },
            stream,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("raiju=info".parse().context("bad log directive")?),
        )
        .init();

    let config = Config::from_env()?;

    info!("Raiju air unit starting");
    info!("  Card(s): {}", config.link.interfaces.join(", "));
    info!(
        "  RF: {} MHz @ {} MHz, mcs {}",
        config.link.radio.frequency_mhz,
        config.link.radio.channel_width_mhz,
        config.link.radio.mcs_index,
    );
    info!(
        "  Video: {} {}x{} @ {}fps, {} bps",
        config.stream.codec,
        config.stream.width,
        config.stream.height,
        config.stream.fps,
        config.stream.bitrate_bps,
    );

    // Construction-time failures are fatal: exit non-zero via main
    let link = Arc::new(
        WirelessLink::new(config.link).context("failed to bring up the wireless link")?,
    );

    let sink_link = Arc::clone(&link);
    let stream = Arc::new(VideoStream::new(
        Arc::new(GstLaunchEngine::default()),
        config.stream,
        move |group| {
            sink_link.transmit(group);
        },
    ));

    stream
        .setup()
        .context("failed to construct the video pipeline")?;
    stream.start();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to install the shutdown handler")?;
    }

    // Supervision loop: debug snapshots and a pipeline health check,
    // once per second, until interrupted
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        info!("{}", link.debug_state());
        info!("{}", stream.debug_state());
        stream.health_check();
    }

    info!("shutting down");
    stream.stop();
    stream.cleanup();
    drop(stream);
    // Dropping the link hands the card(s) back to the host
    drop(link);
    info!("air unit stopped");

    Ok(())
}
