use std::fmt::Write as _;
use std::time::Duration;

use shmframe::{Frame, FrameReceiver, ReceiverError};
use thiserror::Error;
use tracing::info;

const SHM_NAME: &str = "/psm_default";
const SERVICE_NAME: &str = "camera/frames";
const TAIL_BYTES: usize = 40;

#[derive(Error, Debug)]
enum Error {
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
}

fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

fn print_frame(frame: &Frame<'_>) {
    let tail = &frame.data[frame.data.len().saturating_sub(TAIL_BYTES)..];
    println!(
        "frame@{} {}x{}x{}; {}",
        frame.sequence(),
        frame.width(),
        frame.height(),
        frame.channels(),
        to_hex(tail)
    );
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("info,shmframe=debug")
        .init();

    // Parse args
    let mut shm_name = SHM_NAME.to_owned();
    let mut address = SERVICE_NAME.to_owned();
    let mut seconds: u64 = 3;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shm" => shm_name = args.next().unwrap_or(shm_name),
            "--addr" => address = args.next().unwrap_or(address),
            "--seconds" => seconds = args.next().and_then(|s| s.parse().ok()).unwrap_or(seconds),
            _ => {}
        }
    }

    info!(shm = %shm_name, address = %address, seconds, "Starting frame receiver");

    let mut receiver = FrameReceiver::new(shm_name, address);
    receiver.set_on_frame(print_frame);
    receiver.start()?;

    std::thread::sleep(Duration::from_secs(seconds));

    receiver.stop();
    info!(stats = ?receiver.stats(), "Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_uppercase_pairs() {
        assert_eq!(to_hex(&[0x0a, 0xff, 0x00]), "0AFF00");
    }
}
