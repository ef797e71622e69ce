use std::sync::Arc;

use dmabuf::{AcquireStep, DmaBufferConfig, DmaBufferDriver, DmaErrorKind, DriverState, config};
use dmabuf_sim::{SimEvent, SimHost};
use linux_raw_sys::errno;

fn driver(host: SimHost) -> DmaBufferDriver<SimHost> {
    DmaBufferDriver::new(Arc::new(host), DmaBufferConfig::default())
}

fn acquires(steps: &[AcquireStep]) -> Vec<SimEvent> {
    steps.iter().copied().map(SimEvent::Acquire).collect()
}

fn releases(steps: &[AcquireStep]) -> Vec<SimEvent> {
    steps.iter().rev().copied().map(SimEvent::Release).collect()
}

fn expected_kind(step: AcquireStep) -> DmaErrorKind {
    match step {
        AcquireStep::ReserveNumber => DmaErrorKind::NumbersExhausted,
        AcquireStep::AllocBuffer => DmaErrorKind::NoMemory,
        _ => DmaErrorKind::RegistrationRejected,
    }
}

#[test]
fn start_then_stop() {
    let mut drv = driver(SimHost::new());
    assert_eq!(drv.state(), DriverState::Unloaded);
    assert!(drv.control().is_none());

    drv.start().unwrap();
    assert_eq!(drv.state(), DriverState::Live);
    assert_eq!(drv.acquired_steps().collect::<Vec<_>>(), AcquireStep::ALL);
    assert_eq!(drv.host().events(), acquires(&AcquireStep::ALL));

    let dev = drv.control().unwrap();
    let phys = dev.phys_addr();
    assert_ne!(phys.as_u64(), 0);
    assert!(phys.is_aligned(dmabuf_sim::DEFAULT_PAGE_SIZE));
    assert_eq!(dev.size(), dmabuf_sim::DEFAULT_PAGE_SIZE * config::BUFFER_PAGES);
    assert_eq!(drv.host().open(config::DEVICE_NAME), Some(dev.devno()));

    drv.stop();
    assert_eq!(drv.state(), DriverState::Unloaded);
    assert!(drv.control().is_none());
    assert!(!drv.host().is_discoverable(config::DEVICE_NAME));
    assert_eq!(drv.host().live_resources(), 0);
    assert_eq!(drv.host().coherent_in_use(), 0);

    let events = drv.host().events();
    assert_eq!(events[AcquireStep::ALL.len()..], releases(&AcquireStep::ALL));
}

#[test]
fn failure_unwinds_in_reverse_order() {
    for (n, &failing) in AcquireStep::ALL.iter().enumerate() {
        let mut drv = driver(SimHost::new());
        drv.host().fail_at(failing);

        let err = drv.start().unwrap_err();
        assert_eq!(err.kind(), expected_kind(failing), "failing at {failing}");

        let done = &AcquireStep::ALL[..n];
        let mut expected = acquires(done);
        expected.extend(releases(done));
        assert_eq!(drv.host().events(), expected, "failing at {failing}");

        assert_eq!(drv.state(), DriverState::Unloaded);
        assert!(drv.control().is_none());
        assert_eq!(drv.acquired_steps().count(), 0);
        assert_eq!(drv.host().live_resources(), 0);
        assert!(!drv.host().is_discoverable(config::DEVICE_NAME));
    }
}

#[test]
fn allocation_failure_releases_four_steps() {
    let mut drv = driver(SimHost::new());
    drv.host().fail_at(AcquireStep::AllocBuffer);

    let err = drv.start().unwrap_err();
    assert_eq!(err.kind(), DmaErrorKind::NoMemory);
    assert_eq!(err.errno(), errno::ENOMEM as i32);

    let released: Vec<_> = drv
        .host()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::Release(step) => Some(step),
            SimEvent::Acquire(_) => None,
        })
        .collect();
    assert_eq!(
        released,
        [
            AcquireStep::CreateNode,
            AcquireStep::CreateClass,
            AcquireStep::RegisterDevice,
            AcquireStep::ReserveNumber,
        ]
    );
    assert!(!drv.host().is_discoverable(config::DEVICE_NAME));
}

#[test]
fn unwind_is_idempotent() {
    let mut drv = driver(SimHost::new());
    drv.start().unwrap();

    drv.unwind();
    let once = drv.host().events();
    drv.unwind();
    drv.stop();
    assert_eq!(drv.host().events(), once);
    assert_eq!(drv.host().live_resources(), 0);
}

#[test]
fn unwind_with_nothing_held_is_noop() {
    let mut drv = driver(SimHost::new());
    drv.unwind();
    drv.stop();
    assert!(drv.host().events().is_empty());
    assert_eq!(drv.state(), DriverState::Unloaded);
}

#[test]
fn start_while_live_is_rejected() {
    let mut drv = driver(SimHost::new());
    drv.start().unwrap();
    let phys = drv.control().unwrap().phys_addr();
    let before = drv.host().events();

    let err = drv.start().unwrap_err();
    assert_eq!(err.kind(), DmaErrorKind::BadState);
    assert_eq!(drv.host().events(), before);
    assert_eq!(drv.state(), DriverState::Live);
    assert_eq!(drv.control().unwrap().phys_addr(), phys);
}

#[test]
fn start_again_after_failure() {
    let mut drv = driver(SimHost::new());
    drv.host().fail_at(AcquireStep::CreateClass);
    assert!(drv.start().is_err());

    drv.start().unwrap();
    assert_eq!(drv.state(), DriverState::Live);
    assert!(drv.host().is_discoverable(config::DEVICE_NAME));
}

#[test]
fn node_resolves_to_registered_number() {
    let mut drv = driver(SimHost::new());
    drv.start().unwrap();
    let reg = *drv.control().unwrap().registration();
    assert_eq!(drv.host().open(config::DEVICE_NAME), Some(reg.devno));
    assert_eq!(reg.devno, drv.control().unwrap().devno());

    drv.stop();
    drv.host().clear_events();
    drv.start().unwrap();
    assert_eq!(drv.host().events(), acquires(&AcquireStep::ALL));
    let again = drv.control().unwrap().registration().devno;
    assert_eq!(drv.host().open(config::DEVICE_NAME), Some(again));
}

#[test]
fn drop_releases_everything() {
    let host = Arc::new(SimHost::new());
    {
        let mut drv = DmaBufferDriver::new(host.clone(), DmaBufferConfig::default());
        drv.start().unwrap();
        assert_eq!(host.live_resources(), AcquireStep::ALL.len());
    }
    assert_eq!(host.live_resources(), 0);
    assert!(!host.is_discoverable(config::DEVICE_NAME));
}

#[test]
fn exhausted_number_space() {
    let mut drv = driver(SimHost::new().with_major_limit(0));
    let err = drv.start().unwrap_err();
    assert_eq!(err.kind(), DmaErrorKind::NumbersExhausted);
    assert_eq!(err.errno(), errno::EBUSY as i32);
    assert!(drv.host().events().is_empty());
}

#[test]
fn coherent_memory_exhausted() {
    let mut drv = driver(SimHost::new().with_coherent_limit(0x1000));
    let err = drv.start().unwrap_err();
    assert_eq!(err.kind(), DmaErrorKind::NoMemory);
    assert_eq!(drv.host().live_resources(), 0);
}

#[test]
fn host_errno_is_propagated() {
    let host = Arc::new(SimHost::new());
    let mut first = DmaBufferDriver::new(host.clone(), DmaBufferConfig::default());
    first.start().unwrap();

    // Same platform device name on the same host.
    let config = DmaBufferConfig::default()
        .with_device_name("dma_buffer1")
        .with_class_name("dma_buffer_class1");
    let mut second = DmaBufferDriver::new(host.clone(), config);
    let err = second.start().unwrap_err();
    assert_eq!(err.kind(), DmaErrorKind::RegistrationRejected);
    assert_eq!(err.errno(), errno::EEXIST as i32);
    assert_eq!(host.live_resources(), AcquireStep::ALL.len());

    let mut third = DmaBufferDriver::new(host.clone(), config.with_platform_name("dma_dummy1"));
    third.start().unwrap();
    assert_ne!(
        first.control().unwrap().phys_addr(),
        third.control().unwrap().phys_addr()
    );
    assert_ne!(first.control().unwrap().devno(), third.control().unwrap().devno());
}

#[test]
fn buffer_follows_page_size() {
    let mut drv = driver(SimHost::new().with_page_size(0x4000));
    drv.start().unwrap();
    let dev = drv.control().unwrap();
    assert_eq!(dev.size(), 0x4000 * config::BUFFER_PAGES);
    assert!(dev.phys_addr().is_aligned(0x4000));
}

#[test]
fn random_failure_points() {
    for _ in 0..32 {
        let n = fastrand::usize(..AcquireStep::ALL.len());
        let failing = AcquireStep::ALL[n];
        let mut drv = driver(SimHost::new());
        drv.host().fail_at(failing);
        assert!(drv.start().is_err());

        let events = drv.host().events();
        assert_eq!(events.len(), 2 * n);
        assert_eq!(events[n..], releases(&AcquireStep::ALL[..n]));
    }
}
