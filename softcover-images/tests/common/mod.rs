#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Cursor,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use softcover_images::{
    ImagePipeline, Locator, NetworkError, PipelineConfig,
    fetch::{ImageTransport, StreamedBody},
};
use tokio::sync::Notify;

#[derive(Clone)]
pub enum Route {
    Body(Bytes),
    Status(u16),
}

/// In-memory transport: scripted routes, per-URL call counts, and optional
/// gates that hold a fetch open until released.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    fetches: Mutex<HashMap<String, usize>>,
    streams: AtomicUsize,
    total: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().insert(url.to_string(), route);
    }

    /// Block fetches of `url` until [`Self::release`].
    pub fn hold(&self, url: &str) {
        self.gates
            .lock()
            .insert(url.to_string(), Arc::new(Notify::new()));
    }

    /// Let the held fetch of `url` finish; later fetches are not held.
    pub fn release(&self, url: &str) {
        if let Some(gate) = self.gates.lock().remove(url) {
            gate.notify_one();
        }
    }

    pub fn calls(&self, url: &str) -> usize {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    async fn respond(&self, locator: &Locator) -> Result<Bytes, NetworkError> {
        let url = locator.address().to_string();
        *self.fetches.lock().entry(url.clone()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().get(&url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.routes.lock().get(&url).cloned() {
            Some(Route::Body(bytes)) => Ok(bytes),
            Some(Route::Status(status)) => {
                Err(NetworkError::Status { status, url })
            }
            None => Err(NetworkError::Status { status: 404, url }),
        }
    }
}

#[async_trait]
impl ImageTransport for FakeTransport {
    async fn fetch(&self, locator: &Locator) -> Result<Bytes, NetworkError> {
        self.respond(locator).await
    }

    async fn stream(
        &self,
        locator: &Locator,
    ) -> Result<StreamedBody, NetworkError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let body = self.respond(locator).await?;
        let len = body.len();
        let chunk = len.div_ceil(4).max(1);
        let chunks: Vec<Result<Bytes, NetworkError>> = (0..len)
            .step_by(chunk)
            .map(|start| Ok(body.slice(start..(start + chunk).min(len))))
            .collect();
        Ok(StreamedBody {
            content_length: Some(len as u64),
            chunks: futures::stream::iter(chunks).boxed(),
        })
    }
}

pub fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        cache_dir: Some(dir.to_path_buf()),
        retry_count: 1,
        retry_delay: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

pub fn pipeline(dir: &Path, transport: &Arc<FakeTransport>) -> ImagePipeline {
    let transport: Arc<dyn ImageTransport> = transport.clone();
    ImagePipeline::with_transport(config_in(dir), transport).unwrap()
}

pub fn locator(url: &str) -> Locator {
    Locator::parse(url).unwrap()
}

/// Opaque JPEG.
pub fn jpeg(width: u32, height: u32) -> Bytes {
    let px = Rgb([200, 80, 40]);
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, px));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    Bytes::from(out)
}

/// PNG with an alpha channel.
pub fn png_with_alpha(width: u32, height: u32) -> Bytes {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([10, 120, 220, 128]),
    ));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    Bytes::from(out)
}

pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
