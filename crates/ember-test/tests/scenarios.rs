//! End-to-end frame loop scenarios over the headless driver.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use ember_gpu::headless::{GpuCompletion, HeadlessConfig, HeadlessDriver, HeadlessSurface};
use ember_gpu::vk;
use ember_gpu::{
    AcquireOutcome, DescriptorPoolBudget, DescriptorSetLayoutBuilder, DescriptorType, Driver,
    FrameBegin, FrameEnd, GpuError, GraphicsConfig, GraphicsContext, PresentOutcome,
    QueueCapabilities, QueueCapability, QueueFamily, Swapchain,
};
use ember_test::{record_clear_pass, FrameHarness, FrameOutcome, HarnessConfig};

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn steady_window_never_recreates() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    let outcomes = harness.run_frames(10).unwrap();

    let indices: Vec<usize> = outcomes
        .iter()
        .map(|outcome| outcome.info().unwrap().frame_index)
        .collect();
    assert_eq!(indices, [0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);

    assert_eq!(harness.recreate_count(), 0);
    assert_eq!(harness.driver().swapchain_create_count(), 1);
    assert_eq!(harness.driver().present_count(), 10);
    harness.check_violations().unwrap();
}

#[test]
fn resize_recreates_exactly_once() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    harness.run_frames(2).unwrap();

    harness.resize(800, 600).unwrap();
    assert_eq!(harness.recreate_count(), 1);
    assert_eq!(harness.context().current_frame_index(), 0);

    for outcome in harness.run_frames(5).unwrap() {
        assert_eq!(outcome.info().unwrap().extent, extent(800, 600));
    }
    assert_eq!(harness.recreate_count(), 1);
    assert_eq!(harness.driver().swapchain_create_count(), 2);
    harness.check_violations().unwrap();
}

#[test]
fn stale_surface_is_detected_at_acquire() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    harness.run_frame().unwrap();

    // The window changed but no resize event was delivered.
    harness.driver().set_window_extent(1024, 768);
    assert_eq!(harness.run_frame().unwrap(), FrameOutcome::Reissued);
    assert_eq!(harness.recreate_count(), 1);

    let info = harness.run_frame().unwrap().info().unwrap();
    assert_eq!(info.extent, extent(1024, 768));
    assert_eq!(info.frame_index, 0);
    harness.check_violations().unwrap();
}

#[test]
fn present_failure_drops_the_frame_and_recovers() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    harness.driver().inject_present(PresentOutcome::Suboptimal);

    assert_eq!(harness.run_frame().unwrap(), FrameOutcome::Lost);
    assert_eq!(harness.recreate_count(), 1);
    assert!(harness.run_frame().unwrap().is_presented());
    harness.check_violations().unwrap();
}

#[test]
fn every_non_acquired_outcome_rebuilds() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    for outcome in [
        AcquireOutcome::NotReady,
        AcquireOutcome::OutOfDate,
        AcquireOutcome::Suboptimal(1),
    ] {
        harness.driver().inject_acquire(outcome);
        assert_eq!(harness.run_frame().unwrap(), FrameOutcome::Reissued);
    }
    assert_eq!(harness.recreate_count(), 3);
    assert!(harness.run_frame().unwrap().is_presented());
    assert_eq!(harness.driver().acquire_count(), 4);
}

#[test]
fn minimized_window_pauses_until_restored() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    harness.run_frame().unwrap();

    harness.resize(0, 0).unwrap();
    assert_eq!(harness.run_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(harness.run_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(harness.recreate_count(), 0);

    harness.resize(640, 480).unwrap();
    let info = harness.run_frame().unwrap().info().unwrap();
    assert_eq!(info.extent, extent(640, 480));
    assert_eq!(harness.recreate_count(), 1);
    // Skipped frames never touch the swapchain.
    assert_eq!(harness.driver().acquire_count(), 2);
}

#[test]
fn resize_is_clamped_to_surface_limits() {
    let surface = HeadlessSurface {
        fixed_extent: false,
        max_image_extent: extent(1024, 1024),
        ..HeadlessSurface::default()
    };
    let headless = HeadlessConfig::default()
        .with_window_extent(800, 600)
        .with_surface(surface);
    let mut harness = FrameHarness::new(HarnessConfig::default().with_headless(headless)).unwrap();
    assert_eq!(harness.context().swapchain().extent(), extent(800, 600));

    harness.resize(2000, 600).unwrap();
    assert_eq!(harness.recreate_count(), 1);

    for outcome in harness.run_frames(3).unwrap() {
        assert_eq!(outcome.info().unwrap().extent, extent(1024, 600));
    }
    assert_eq!(harness.recreate_count(), 1);
    harness.check_violations().unwrap();
}

#[test]
fn exclusive_compute_work_runs_on_its_own_family() {
    let families = vec![
        QueueFamily::new(0, 16, QueueCapabilities::all(), 64),
        QueueFamily::new(1, 4, QueueCapabilities::COMPUTE, 64),
    ];
    let headless = HeadlessConfig::default().with_queue_families(families);
    let mut harness = FrameHarness::new(HarnessConfig::default().with_headless(headless)).unwrap();

    let compute_queue = harness.driver().queues().get(QueueCapability::Compute, true).handle();
    let graphics_queue = harness.driver().queues().graphics().handle();
    assert_ne!(compute_queue, graphics_queue);

    for _ in 0..5 {
        let context = harness.context_mut();
        assert!(matches!(context.begin_frame().unwrap(), FrameBegin::Ready(_)));

        let pool = context.get_current_frame_command_pool(QueueCapability::Compute, true);
        assert_eq!(pool.family().index(), 1);
        let mut compute = pool.get_command_buffer().unwrap();
        compute.begin().unwrap();
        compute.end().unwrap();
        context.submit_command_buffer(compute);

        record_clear_pass(context, [0.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(context.end_frame().unwrap(), FrameEnd::Presented);
    }

    let submissions = harness.driver().submissions();
    assert_eq!(submissions.len(), 10);
    for pair in submissions.chunks(2) {
        let (compute, graphics) = (&pair[0], &pair[1]);
        assert_eq!(compute.queue, compute_queue);
        assert_eq!(compute.fence, None);
        assert_eq!(graphics.queue, graphics_queue);
        assert!(graphics.fence.is_some());
        // Graphics work waits for this frame's compute batch.
        assert_eq!(compute.signal_semaphores.len(), 1);
        assert!(graphics
            .wait_semaphores
            .contains(&compute.signal_semaphores[0]));
    }
    harness.check_violations().unwrap();
}

#[test]
fn descriptor_budget_is_enforced() {
    const CONSTANT_BUFFERS: u32 = 4;

    let budget = DescriptorPoolBudget::new(16).with(DescriptorType::ConstantBuffer, CONSTANT_BUFFERS);
    let config = HarnessConfig::default()
        .with_graphics(GraphicsConfig::default().with_descriptor_budget(budget));
    let mut harness = FrameHarness::new(config).unwrap();

    let layout = DescriptorSetLayoutBuilder::new()
        .constant_buffer(0, vk::ShaderStageFlags::VERTEX)
        .build(harness.driver())
        .unwrap();

    let pool = harness.context_mut().get_descriptor_pool();
    for _ in 0..CONSTANT_BUFFERS {
        pool.get_descriptor_set(&layout).unwrap();
    }

    let err = pool.get_descriptor_set(&layout).unwrap_err();
    assert!(err.is_capacity());
    assert!(matches!(
        err,
        GpuError::CapacityExhausted {
            requested: 5,
            capacity: 4,
            ..
        }
    ));
    assert_eq!(pool.used(DescriptorType::ConstantBuffer), CONSTANT_BUFFERS);
    assert_eq!(
        harness.driver().descriptor_set_allocation_count(),
        u64::from(CONSTANT_BUFFERS)
    );

    // Frames keep running after exhaustion, and a reset makes room again.
    assert!(harness.run_frame().unwrap().is_presented());
    let pool = harness.context_mut().get_descriptor_pool();
    pool.reset().unwrap();
    pool.get_descriptor_set(&layout).unwrap();
}

#[test]
fn layout_without_budget_is_a_capacity_error() {
    let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
    let layout = DescriptorSetLayoutBuilder::new()
        .storage_texture(0, vk::ShaderStageFlags::COMPUTE)
        .build(harness.driver())
        .unwrap();
    let err = harness
        .context_mut()
        .get_descriptor_pool()
        .get_descriptor_set(&layout)
        .unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(harness.driver().descriptor_set_allocation_count(), 0);
}

#[test]
#[should_panic(expected = "swapchain image acquired twice")]
fn double_acquire_panics() {
    let driver = Arc::new(HeadlessDriver::default());
    let mut swapchain = Swapchain::new(&driver, driver.window_extent()).unwrap();
    let first = driver.create_semaphore().unwrap();
    let second = driver.create_semaphore().unwrap();

    assert!(matches!(
        swapchain.acquire_image(first).unwrap(),
        AcquireOutcome::Acquired(_)
    ));
    let _ = swapchain.acquire_image(second);
}

#[test]
#[should_panic(expected = "present called without an acquired swapchain image")]
fn present_without_acquire_panics() {
    let driver = Arc::new(HeadlessDriver::default());
    let mut swapchain = Swapchain::new(&driver, driver.window_extent()).unwrap();
    let semaphore = driver.create_semaphore().unwrap();
    let queue = driver.queues().present().handle();
    let _ = swapchain.present_image(queue, semaphore);
}

#[test]
fn recreate_without_surface_change_is_idempotent() {
    let driver = Arc::new(HeadlessDriver::default());
    let mut swapchain = Swapchain::new(&driver, driver.window_extent()).unwrap();
    let before = (
        swapchain.extent(),
        swapchain.format(),
        swapchain.present_mode(),
        swapchain.image_count(),
    );
    let live = driver.live_object_count();

    for expected in 1..=2 {
        assert!(swapchain.recreate().unwrap());
        assert_eq!(swapchain.recreate_count(), expected);
        assert_eq!(
            (
                swapchain.extent(),
                swapchain.format(),
                swapchain.present_mode(),
                swapchain.image_count(),
            ),
            before
        );
        assert_eq!(driver.live_object_count(), live);
    }
    assert!(driver.violations().is_empty(), "{:?}", driver.violations());
}

#[test]
fn cpu_never_runs_more_than_frames_in_flight_ahead() {
    const FRAMES_IN_FLIGHT: usize = 3;

    let config = HarnessConfig::default()
        .with_completion(GpuCompletion::Manual)
        .with_frames_in_flight(FRAMES_IN_FLIGHT);
    let harness = FrameHarness::new(config).unwrap();
    let driver = Arc::clone(harness.driver());

    let (tx, rx) = channel::unbounded();
    let worker = thread::spawn(move || {
        let mut harness = harness;
        for _ in 0..=FRAMES_IN_FLIGHT {
            let outcome = harness.run_frame().unwrap();
            tx.send(outcome).unwrap();
        }
        harness
    });

    // The first K frames only need free slots.
    for expected in 0..FRAMES_IN_FLIGHT {
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.info().unwrap().frame_index, expected);
    }

    // Frame K+1 reuses slot 0 and must wait for its submission to retire.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(driver.pending_submission_count(), FRAMES_IN_FLIGHT);

    assert!(driver.complete_next_submission());
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.info().unwrap().frame_index, 0);
    assert!(driver.blocked_fence_waits() >= 1);

    let harness = worker.join().unwrap();
    harness.check_violations().unwrap();
}

#[test]
fn context_works_over_any_driver_instance() {
    let driver = Arc::new(HeadlessDriver::default());
    let config = GraphicsConfig::default().with_frames_in_flight(2);
    let mut context = GraphicsContext::new(Arc::clone(&driver), &config, driver.window_extent())
        .unwrap();

    for expected in [0, 1, 0] {
        let FrameBegin::Ready(info) = context.begin_frame().unwrap() else {
            panic!("frame was not ready");
        };
        assert_eq!(info.frame_index, expected);
        record_clear_pass(&mut context, [1.0, 0.0, 0.0, 1.0]).unwrap();
        context.end_frame().unwrap();
    }

    drop(context);
    assert_eq!(driver.live_object_count(), 0);
}
