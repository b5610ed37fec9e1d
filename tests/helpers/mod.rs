//! Shared helpers for the coordinator, preprocessing and API tests
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use scan_sync::app_state::AppState;
use scan_sync::config::AppConfig;
use scan_sync::models::event::{EventKind, LifecycleEvent};
use scan_sync::services::coordinator::Coordinator;
use scan_sync::services::memory_store::MemoryRecordStore;
use scan_sync::services::preprocess::ImagePreprocessor;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), format)
        .expect("Failed to encode test image");
    buffer
}

/// Compressed test image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(gradient(width, height)), ImageFormat::Png)
}

/// Test image with an alpha channel.
pub fn rgba_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 0, (x % 2 * 255) as u8]));
    encode(DynamicImage::ImageRgba8(image), ImageFormat::Png)
}

/// Uncompressed test image: roughly 3 bytes per pixel, cheap to produce at size.
pub fn bmp_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(gradient(width, height)), ImageFormat::Bmp)
}

pub fn dimensions(bytes: &[u8]) -> (u32, u32) {
    let image = image::load_from_memory(bytes).expect("Output is not a decodable image");
    (image.width(), image.height())
}

pub fn spawn_coordinator() -> (Arc<MemoryRecordStore>, Coordinator) {
    spawn_coordinator_with(ImagePreprocessor::default())
}

pub fn spawn_coordinator_with(
    preprocessor: ImagePreprocessor,
) -> (Arc<MemoryRecordStore>, Coordinator) {
    let store = Arc::new(MemoryRecordStore::recording());
    let coordinator = Coordinator::spawn(store.clone(), preprocessor, 64);
    (store, coordinator)
}

/// Wait for the next lifecycle event.
pub async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for lifecycle event")
        .expect("Event channel closed")
}

/// Wait for the next event and check its kind.
pub async fn expect_event(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    kind: EventKind,
) -> LifecycleEvent {
    let event = next_event(events).await;
    assert_eq!(event.kind, kind, "unexpected event {:?}", event);
    event
}

/// Assert nothing is emitted for a short while.
pub async fn assert_no_event(events: &mut broadcast::Receiver<LifecycleEvent>) {
    if let Ok(event) = timeout(QUIET_PERIOD, events.recv()).await {
        panic!("Unexpected lifecycle event: {:?}", event);
    }
}

/// Poll `condition` until it holds or the event timeout passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "Condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Serve the API on an ephemeral port, returning its base URL.
pub async fn spawn_app(store: Arc<MemoryRecordStore>, coordinator: Coordinator) -> String {
    let config = AppConfig::from_vars(Vec::new()).expect("Default config is invalid");
    let app = scan_sync::routes::router(AppState::new(coordinator, store), config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Listener has no address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server error");
    });
    format!("http://{}", addr)
}
