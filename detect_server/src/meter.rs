use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Counters of processed work, reset whenever they are logged.
#[derive(Default)]
pub struct Meter {
    streamed_frames: AtomicU64,
    processed_images: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            streamed_frames: AtomicU64::new(0),
            processed_images: AtomicU64::new(0),
        }
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_image(&self) {
        self.processed_images.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_images(&self) -> u64 {
        self.processed_images.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let streamed_frames = METER.get_reset_streamed();
            let processed_images = METER.get_reset_images();
            let elapsed = start.elapsed().as_secs_f32();

            if streamed_frames > 0 {
                let fps = streamed_frames as f32 / elapsed;
                log::info!("Streamed frames per second: {fps:.2}")
            }
            if processed_images > 0 {
                log::info!("Processed {processed_images} images in {elapsed:.1}s")
            }
        }
    })
}
