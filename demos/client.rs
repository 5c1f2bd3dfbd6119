//! Interactive test client: sends a message frame every interval and prints
//! every frame the relay sends back (echoes and broker broadcasts).
//!
//! cargo run --example client -- [address] [interval_secs] [message]

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use relayd::protocol::{Frame, FrameCodec};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tokio_util::codec::Framed;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:18866".to_string());
    let interval_secs: u64 = match args.next() {
        Some(secs) => secs.parse().context("interval must be whole seconds")?,
        None => 1,
    };
    let message = args.next().unwrap_or_else(|| "Test Msg".to_string());

    let stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("Failed to connect to {address}"))?;
    println!("Connected to {address}, sending every {interval_secs}s");

    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::default()).split();

    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sent += 1;
                sink.send(Frame::message(message.clone())).await?;
                println!("-> #{sent} {message}");
            }

            next = frames.next() => match next {
                Some(Ok(frame)) => println!(
                    "<- type {} ({} bytes): {}",
                    frame.frame_type,
                    frame.payload.len(),
                    String::from_utf8_lossy(&frame.payload)
                ),
                Some(Err(e)) => return Err(e).context("Malformed frame from relay"),
                None => {
                    println!("Relay closed the connection");
                    return Ok(());
                }
            },

            _ = tokio::signal::ctrl_c() => {
                println!("Sent {sent} messages, bye");
                return Ok(());
            }
        }
    }
}
