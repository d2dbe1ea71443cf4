//! Synthetic producer: writes a moving gradient into shared memory and
//! signals an iceoryx2 event service after every frame.
//!
//! Terminal 1:
//!   $ cargo run --bin test_pattern -- --width 640 --height 480
//!
//! Terminal 2:
//!   $ cargo run --bin shmframe

use std::time::{Duration, Instant};

use iceoryx2::prelude::*;
use shmframe::{FrameHeader, SegmentError, SegmentWriter, segment_len};
use thiserror::Error;
use tracing::{debug, info, warn};

const SHM_NAME: &str = "/psm_default";
const SERVICE_NAME: &str = "camera/frames";

#[derive(Error, Debug)]
enum Error {
    #[error("unusable frame size {0}x{1}x{2}")]
    FrameSize(u32, u32, u32),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("iceoryx2 error: {0}")]
    Ipc(String),
}

fn fill_pattern(pixels: &mut [u8], width: u32, channels: u32, seq: u64) {
    let row_len = (width * channels) as usize;
    for (y, row) in pixels.chunks_exact_mut(row_len).enumerate() {
        for (x, px) in row.chunks_exact_mut(channels as usize).enumerate() {
            for (c, value) in px.iter_mut().enumerate() {
                *value = (x as u64 + y as u64 * (c as u64 + 1) + seq) as u8;
            }
        }
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("info,shmframe=debug,test_pattern=debug")
        .init();

    // Parse args
    let mut shm_name = SHM_NAME.to_owned();
    let mut address = SERVICE_NAME.to_owned();
    let mut width: u32 = 1280;
    let mut height: u32 = 720;
    let mut channels: u32 = 3;
    let mut fps: u32 = 30;
    let mut frames: u64 = 0;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shm" => shm_name = args.next().unwrap_or(shm_name),
            "--addr" => address = args.next().unwrap_or(address),
            "--width" => width = args.next().and_then(|s| s.parse().ok()).unwrap_or(width),
            "--height" => height = args.next().and_then(|s| s.parse().ok()).unwrap_or(height),
            "--channels" => {
                channels = args.next().and_then(|s| s.parse().ok()).unwrap_or(channels)
            }
            "--fps" => fps = args.next().and_then(|s| s.parse().ok()).unwrap_or(fps).max(1),
            "--frames" => frames = args.next().and_then(|s| s.parse().ok()).unwrap_or(frames),
            _ => {}
        }
    }

    info!(width, height, channels, fps, "Starting test pattern producer");

    let len = segment_len(width, height, channels)
        .filter(|_| width > 0 && height > 0 && channels > 0)
        .ok_or(Error::FrameSize(width, height, channels))?;
    let mut segment = SegmentWriter::create(&shm_name, len)?;
    let mut pixels = vec![0u8; len - shmframe::HEADER_LEN];

    // Set up iceoryx2 notifier
    let node = NodeBuilder::new()
        .create::<ipc::Service>()
        .map_err(|e| Error::Ipc(format!("{e:?}")))?;

    let service_name: ServiceName = address
        .as_str()
        .try_into()
        .map_err(|e| Error::Ipc(format!("{e:?}")))?;
    let service = node
        .service_builder(&service_name)
        .event()
        .open_or_create()
        .map_err(|e| Error::Ipc(format!("{e:?}")))?;

    let notifier = service
        .notifier_builder()
        .create()
        .map_err(|e| Error::Ipc(format!("{e:?}")))?;

    info!(shm = %segment.name(), len, address = %address, "Producer ready");

    let period = Duration::from_secs(1) / fps;
    let mut next = Instant::now();
    let mut seq: u64 = 0;

    while frames == 0 || seq < frames {
        fill_pattern(&mut pixels, width, channels, seq);
        let header = FrameHeader {
            sequence: seq,
            width,
            height,
            channels,
        };
        segment.write_frame(&header, &pixels)?;

        match notifier.notify() {
            Ok(listeners) => debug!(seq, listeners, "Published"),
            Err(e) => warn!("Notify failed: {e:?}"),
        }

        seq += 1;
        if seq % 100 == 0 {
            info!(seq, "Progress");
        }

        next += period;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        } else {
            next = Instant::now();
        }
    }

    info!(seq, "Finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_shifts_with_sequence() {
        let mut a = vec![0u8; 2 * 2 * 3];
        let mut b = vec![0u8; 2 * 2 * 3];
        fill_pattern(&mut a, 2, 3, 0);
        fill_pattern(&mut b, 2, 3, 1);
        assert_eq!(a[0], 0);
        assert_eq!(b[0], 1);
        assert_eq!(a[3], 1);
    }
}
