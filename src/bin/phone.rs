//! Terminal Voice Phone
//!
//! Places a duplex voice call to a peer and takes commands on stdin:
//!
//! ```text
//! voip-phone [--config PATH] [--list-devices] <peer-ip> <peer-port> <local-port>
//!
//!   call            place the call (done automatically at startup)
//!   hangup          end the call
//!   gain <1.0-5.0>  microphone gain
//!   gate <0-1000>   noise gate RMS threshold
//!   mute | unmute
//!   quit
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2p_voice_call::{
    audio::{list_devices, CpalBackend},
    config::AppConfig,
    constants::*,
    session::{format_elapsed, CallController, CallParams, SessionEvent},
};

struct Args {
    config: Option<PathBuf>,
    list_devices: bool,
    params: CallParams,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut list_devices = false;
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--list-devices" => list_devices = true,
            _ => positional.push(arg),
        }
    }

    let peer_host = positional.first().cloned().unwrap_or_else(|| "127.0.0.1".to_string());
    let peer_port = match positional.get(1) {
        Some(p) => p.parse().with_context(|| format!("Invalid peer port: {}", p))?,
        None => DEFAULT_PEER_PORT,
    };
    let local_port = match positional.get(2) {
        Some(p) => p.parse().with_context(|| format!("Invalid local port: {}", p))?,
        None => DEFAULT_LOCAL_PORT,
    };
    if positional.len() > 3 {
        bail!("Unexpected arguments: {:?}", &positional[3..]);
    }

    Ok(Args {
        config,
        list_devices,
        params: CallParams {
            peer_host,
            peer_port,
            local_port,
        },
    })
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();
}

/// Returns `false` when the user asked to quit
fn handle_command(line: &str, phone: &mut CallController, params: &CallParams) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let value = words.next().map(str::parse::<f32>);

    match (command, value) {
        ("call", _) => {
            if let Err(e) = phone.start_call(params) {
                println!("Status: Error ({})", e);
            } else {
                println!("Status: Calling...");
            }
        }
        ("hangup", _) => match phone.hang_up() {
            Ok(summary) => println!(
                "Status: Disconnected ({} sent, {} received)",
                summary.packets_sent, summary.packets_received
            ),
            Err(e) => println!("{}", e),
        },
        ("gain", Some(Ok(gain))) => {
            phone.set_gain(gain);
            println!("Gain: {:.1}", phone.gain());
        }
        ("gate", Some(Ok(threshold))) => {
            phone.set_noise_gate_threshold(threshold);
            println!("Noise gate: {:.0}", phone.noise_gate_threshold());
        }
        ("mute", _) | ("unmute", _) => {
            if let Err(e) = phone.set_muted(command == "mute") {
                println!("{}", e);
            }
        }
        ("quit", _) | ("exit", _) => return false,
        _ => println!("Commands: call, hangup, gain <1-5>, gate <0-1000>, mute, unmute, quit"),
    }
    true
}

/// Run controller work that joins threads or waits on the audio device
/// without stalling the runtime's other tasks
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    tokio::task::block_in_place(f)
}

fn render_status(phone: &CallController) -> String {
    let time = phone
        .elapsed_seconds()
        .map(format_elapsed)
        .unwrap_or_else(|| "--:--".to_string());
    let bars = (phone.mic_level() * 20.0).round() as usize;
    format!(
        "Time: {}  Mic: [{:<20}]{}",
        time,
        "#".repeat(bars),
        if phone.is_muted() { "  (muted)" } else { "" }
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };
    tracing::info!(
        "Starting voice phone: {} Hz, {} frames/tick, jitter {} slots (delay {})",
        config.audio.sample_rate,
        config.audio.frames_per_buffer,
        config.jitter.capacity,
        config.jitter.min_playout_delay
    );

    let mut phone = CallController::new(config, Arc::new(CpalBackend));
    blocking(|| handle_command("call", &mut phone, &args.params));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = tokio::time::interval(Duration::from_millis(50));
    let mut status = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !blocking(|| handle_command(line.trim(), &mut phone, &args.params)) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = events.tick() => {
                for event in blocking(|| phone.poll_events()) {
                    match event {
                        SessionEvent::PlayoutStarted => println!("Status: Connected"),
                        SessionEvent::PeerLost(reason) => println!("Status: Peer lost ({})", reason),
                        SessionEvent::DeviceFailed(e) => println!("Status: Audio error ({})", e),
                        SessionEvent::CallEnded(summary) => {
                            println!("Status: Disconnected");
                            tracing::info!(
                                "Call {} with {} ended after {}",
                                summary.id,
                                summary.peer,
                                summary.talk_seconds.map(format_elapsed).unwrap_or_default()
                            );
                        }
                    }
                }
            }
            _ = status.tick() => {
                if phone.is_in_call() {
                    println!("{}", render_status(&phone));
                }
            }
        }
    }

    if phone.is_in_call() {
        let summary = blocking(|| phone.hang_up())?;
        tracing::info!(
            "Call {} ended: {} sent, {} received, {:.1}% concealed",
            summary.id,
            summary.packets_sent,
            summary.packets_received,
            summary.jitter.loss_rate() * 100.0
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_work_leaves_runtime_responsive() {
        let finished = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let slow = {
            let order = order.clone();
            tokio::spawn(async move {
                blocking(|| std::thread::sleep(Duration::from_millis(300)));
                order.lock().push("slow");
            })
        };
        let ticker = {
            let (finished, order) = (finished.clone(), order.clone());
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().push("ticker");
            })
        };

        slow.await.unwrap();
        ticker.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert_eq!(*order.lock(), vec!["ticker", "slow"]);
    }
}
