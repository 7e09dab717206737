//! Integration tests for live-mode transitions, suspension, and snap
//! behavior, run against the simulated device core.

use scope_console::core::{DeviceCore, Image};
use scope_console::data::{ImageProcessor, PipelineFactory};
use scope_console::device::MockDeviceCore;
use scope_console::display::HeadlessDisplayFactory;
use scope_console::error::{DeviceError, LiveError};
use scope_console::live::LiveHandle;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pipeline factory whose processors record every image they see and can be
/// switched into a failing mode.
#[derive(Clone, Default)]
struct TestPipelineFactory {
    attempts: Arc<AtomicUsize>,
    inserted: Arc<Mutex<Vec<(usize, Option<u64>)>>>,
    fail: Arc<AtomicBool>,
}

impl TestPipelineFactory {
    fn inserted(&self) -> Vec<(usize, Option<u64>)> {
        self.inserted.lock().unwrap().clone()
    }

    fn insert_count(&self) -> usize {
        self.inserted.lock().unwrap().len()
    }
}

struct TestProcessor {
    attempts: Arc<AtomicUsize>,
    inserted: Arc<Mutex<Vec<(usize, Option<u64>)>>>,
    fail: Arc<AtomicBool>,
}

impl ImageProcessor for TestProcessor {
    fn name(&self) -> &str {
        "test-recorder"
    }

    fn process(&mut self, image: Image) -> anyhow::Result<Image> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("injected processing failure");
        }
        self.inserted
            .lock()
            .unwrap()
            .push((image.coords.channel, image.metadata.image_number));
        Ok(image)
    }
}

impl PipelineFactory for TestPipelineFactory {
    fn build(&self) -> Vec<Box<dyn ImageProcessor>> {
        vec![Box::new(TestProcessor {
            attempts: self.attempts.clone(),
            inserted: self.inserted.clone(),
            fail: self.fail.clone(),
        })]
    }
}

fn spawn_console(
    device: Arc<MockDeviceCore>,
) -> (LiveHandle, TestPipelineFactory) {
    let pipelines = TestPipelineFactory::default();
    let handle = LiveHandle::spawn(
        device,
        Arc::new(HeadlessDisplayFactory::new(Duration::from_millis(1))),
        Arc::new(pipelines.clone()),
    );
    (handle, pipelines)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn set_live_mode_is_idempotent_and_publishes_one_event() {
    let device = Arc::new(MockDeviceCore::builder().build());
    let (live, _pipelines) = spawn_console(device.clone());
    let mut events = live.subscribe();

    live.set_live_mode(true).await.unwrap();
    live.set_live_mode(true).await.unwrap();
    assert!(live.is_live_mode_on());
    assert!(device.is_acquiring().await);
    assert_eq!(device.start_calls(), 1);

    live.set_live_mode(false).await.unwrap();
    assert!(!live.is_live_mode_on());
    assert!(!device.is_acquiring().await);

    // Exactly one on-event and one off-event despite the repeated call.
    assert!(events.recv().await.unwrap().is_on);
    assert!(!events.recv().await.unwrap().is_on);
    assert!(events.try_recv().is_err());

    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn balanced_suspension_restores_physical_streaming() {
    let device = Arc::new(MockDeviceCore::builder().build());
    let (live, _pipelines) = spawn_console(device.clone());

    live.set_live_mode(true).await.unwrap();
    assert!(device.is_acquiring().await);

    // Nested suspends: only the outermost pair touches the hardware.
    live.set_suspended(true).await.unwrap();
    assert!(!device.is_acquiring().await);
    live.set_suspended(true).await.unwrap();
    live.set_suspended(false).await.unwrap();
    assert!(!device.is_acquiring().await);
    live.set_suspended(false).await.unwrap();
    assert!(device.is_acquiring().await);

    // Suspension never changed the nominal state.
    assert!(live.is_live_mode_on());

    live.set_live_mode(false).await.unwrap();
    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn suspension_does_not_fire_mode_events() {
    let device = Arc::new(MockDeviceCore::builder().build());
    let (live, _pipelines) = spawn_console(device.clone());
    live.set_live_mode(true).await.unwrap();

    let mut events = live.subscribe();
    live.set_suspended(true).await.unwrap();
    live.set_suspended(false).await.unwrap();
    assert!(events.try_recv().is_err());

    live.set_live_mode(false).await.unwrap();
    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn hardware_start_failure_forces_live_mode_off() {
    let device = Arc::new(MockDeviceCore::builder().build());
    device.set_fail_start(true);
    let (live, _pipelines) = spawn_console(device.clone());
    let mut events = live.subscribe();

    let result = live.set_live_mode(true).await;
    assert!(matches!(
        result,
        Err(LiveError::Device(DeviceError::StartFailed(_)))
    ));
    assert!(!live.is_live_mode_on());
    assert!(!device.is_acquiring().await);
    assert!(!events.recv().await.unwrap().is_on);

    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn processing_error_stops_live_mode_within_one_cycle() {
    let device = Arc::new(MockDeviceCore::builder().build());
    device.push_frame(Some(0));
    let (live, pipelines) = spawn_console(device.clone());
    pipelines.fail.store(true, Ordering::SeqCst);

    live.set_live_mode(true).await.unwrap();
    wait_until("live mode to stop after processing error", || {
        !live.is_live_mode_on()
    })
    .await;
    assert!(!device.is_acquiring().await);

    // No further submissions while stopped.
    let attempts = pipelines.attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipelines.attempts.load(Ordering::SeqCst), attempts);

    // A clean restart processes images again.
    pipelines.fail.store(false, Ordering::SeqCst);
    device.push_frame(Some(0));
    live.set_live_mode(true).await.unwrap();
    let attempts_before = pipelines.attempts.load(Ordering::SeqCst);
    wait_until("processing to resume after restart", || {
        pipelines.attempts.load(Ordering::SeqCst) > attempts_before
            || pipelines.insert_count() > 0
    })
    .await;
    assert!(live.is_live_mode_on());

    live.set_live_mode(false).await.unwrap();
    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn snap_during_live_returns_cache_without_device_access() {
    let device = Arc::new(MockDeviceCore::builder().build());
    device.push_frame(Some(0));
    let (live, pipelines) = spawn_console(device.clone());

    live.set_live_mode(true).await.unwrap();
    wait_until("first live image to land", || pipelines.insert_count() > 0).await;

    let images = live.snap(true).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(device.snap_calls(), 0);

    live.set_live_mode(false).await.unwrap();
    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn snap_when_off_performs_single_shot_acquisition() {
    let device = Arc::new(MockDeviceCore::builder().channels(2).build());
    let (live, pipelines) = spawn_console(device.clone());

    let images = live.snap(false).await.unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(device.snap_calls(), 1);
    // Without display routing, nothing reaches the pipeline.
    assert_eq!(pipelines.insert_count(), 0);

    // With display routing, each channel lands in the pipeline.
    let images = live.snap(true).await.unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(device.snap_calls(), 2);
    assert_eq!(pipelines.insert_count(), 2);
    let channels: Vec<usize> = pipelines.inserted().iter().map(|(ch, _)| *ch).collect();
    assert_eq!(channels, vec![0, 1]);

    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn snap_failure_propagates_to_caller() {
    let device = Arc::new(MockDeviceCore::builder().build());
    device.set_fail_snap(true);
    let (live, pipelines) = spawn_console(device.clone());

    let result = live.snap(true).await;
    assert!(matches!(
        result,
        Err(LiveError::Device(DeviceError::SnapFailed(_)))
    ));
    assert_eq!(pipelines.insert_count(), 0);

    live.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_after_shutdown_report_controller_gone() {
    let device = Arc::new(MockDeviceCore::builder().build());
    let (live, _pipelines) = spawn_console(device.clone());

    live.shutdown().await.unwrap();

    // The controller task has returned; either the send or the response
    // fails, both reported as the controller being gone.
    let result = live.set_live_mode(true).await;
    assert!(matches!(result, Err(LiveError::ControllerGone)));
}
