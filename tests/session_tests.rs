// This is free and unencumbered software released into the public domain.

//! Integration tests for the camera session state machine and capture pipeline.

mod support;

use asimov_camera_session::shared::{
    CameraState, CaptureOptions, CaptureStatus, ErrorCode, Frame, ImageSettings, PixelFormat,
    SessionConfig, SessionEvent, SessionState, Size, VideoOutput,
};
use bytes::Bytes;
use std::{
    sync::{Arc, atomic::Ordering, mpsc},
    time::{Duration, Instant},
};
use support::{FakeVideoOutput, Harness};

fn state_changes(events: &[SessionEvent]) -> Vec<CameraState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

#[test]
fn test_open_failure_returns_to_closed() {
    let h = Harness::new();
    h.camera.fail_open.store(true, Ordering::SeqCst);

    h.session.set_state(CameraState::Active);
    let (event, before) = h.wait_for(|e| matches!(e, SessionEvent::Error { .. }));

    match event {
        SessionEvent::Error { code, message } => {
            assert_eq!(code, ErrorCode::Camera);
            assert_eq!(message, "Failed to open camera");
        },
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.session.target_state(), CameraState::Unloaded);
    assert!(
        before
            .iter()
            .any(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loading)))
    );
    assert!(state_changes(&before).is_empty(), "coarse state never left Unloaded");
}

#[test]
fn test_preview_waits_for_a_video_output() {
    let h = Harness::new();
    h.session.set_state(CameraState::Active);
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));

    assert_eq!(h.session.state(), SessionState::Loaded);
    assert_eq!(h.camera.count("start_preview"), 0);

    let output = FakeVideoOutput::new(true);
    let dyn_output: Arc<dyn VideoOutput> = output.clone();
    h.session.bind_video_output(&dyn_output);
    h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));

    assert_eq!(h.session.state(), SessionState::Active);
    assert!(h.session.is_ready_for_capture());
    assert!(output.is_running());
    let target = h.camera.position("set_preview_target").unwrap();
    let start = h.camera.position("start_preview").unwrap();
    assert!(target < start, "preview target must be set before the preview starts");
}

#[test]
fn test_output_readiness_releases_deferred_preview() {
    let h = Harness::new();
    let output = FakeVideoOutput::new(false);
    let dyn_output: Arc<dyn VideoOutput> = output.clone();
    h.session.bind_video_output(&dyn_output);
    h.session.set_state(CameraState::Active);
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));
    assert_eq!(h.camera.count("start_preview"), 0);

    output.set_ready(true);
    h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    assert_eq!(h.camera.count("start_preview"), 1);
}

#[test]
fn test_state_changes_walk_through_loaded() {
    let h = Harness::new();
    let output = FakeVideoOutput::new(true);
    let dyn_output: Arc<dyn VideoOutput> = output.clone();
    h.session.bind_video_output(&dyn_output);
    h.session.set_state(CameraState::Active);
    let (_, before) = h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    assert_eq!(
        state_changes(&before),
        vec![CameraState::Loaded, CameraState::Active]
    );

    h.session.close();
    assert_eq!(h.session.state(), SessionState::Closed);
    let after = h.drain(Duration::from_millis(100));
    assert_eq!(
        state_changes(&after),
        vec![CameraState::Loaded, CameraState::Unloaded]
    );
    assert_eq!(h.camera.count("release"), 1);
}

#[test]
fn test_repeated_state_request_is_a_no_op() {
    let h = Harness::new();
    h.activate();
    h.session.set_state(CameraState::Active);
    h.session.set_state(CameraState::Active);
    let _ = h.drain(Duration::from_millis(100));

    assert_eq!(h.camera.count("open"), 1);
    assert_eq!(h.camera.count("start_preview"), 1);
}

#[test]
fn test_capture_delivers_every_requested_output() {
    let h = Harness::new();
    h.activate();

    let id = h
        .session
        .capture(CaptureOptions::to_file("still").with_buffer(true));
    assert!(!h.session.is_ready_for_capture());
    assert_eq!(h.camera.count("take_picture"), 1);

    h.camera.expose();
    h.wait_for(|e| matches!(e, SessionEvent::ImageExposed(got) if *got == id));
    h.camera.deliver();

    let (mut saved, mut available, mut preview, mut ready) = (None, None, None, false);
    h.wait_for(|e| {
        match e {
            SessionEvent::ImageSaved { id: got, path } if *got == id => saved = Some(path.clone()),
            SessionEvent::ImageAvailable { id: got, frame } if *got == id => available = Some(frame.clone()),
            SessionEvent::ImageCaptured { id: got, frame } if *got == id => preview = Some(frame.clone()),
            SessionEvent::ReadyForCaptureChanged(true) => ready = true,
            SessionEvent::ImageCaptureError { .. } => panic!("capture failed: {e:?}"),
            _ => {},
        }
        saved.is_some() && available.is_some() && preview.is_some() && ready
    });

    let path = saved.unwrap();
    assert_eq!(path, h.dir.join("still.jpg"));
    assert!(path.exists());

    let available = available.unwrap();
    assert_eq!(available.pixel_format, PixelFormat::Jpeg);
    assert_eq!(available.size(), Size::new(8, 6));

    // The 4x2 preview frame is rotated by the 90 degree sensor mounting.
    assert_eq!(preview.unwrap().size(), Size::new(2, 4));
    assert_eq!(h.session.capture_status(id), Some(CaptureStatus::Captured));
}

#[test]
fn test_cancel_before_exposure_discards_the_picture() {
    let h = Harness::new();
    h.activate();

    let id = h.session.capture(CaptureOptions::default());
    assert!(h.session.cancel_capture());
    h.camera.expose();
    h.camera.deliver();

    let (_, before) = h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    let late = h.drain(Duration::from_millis(150));
    for event in before.iter().chain(&late) {
        assert!(
            !matches!(
                event,
                SessionEvent::ImageExposed(_)
                    | SessionEvent::ImageSaved { .. }
                    | SessionEvent::ImageCaptured { .. }
                    | SessionEvent::ImageCaptureError { .. }
            ),
            "canceled capture produced {event:?}"
        );
    }
    assert_eq!(h.session.capture_status(id), Some(CaptureStatus::Canceled));
}

#[test]
fn test_cancel_after_exposure_is_ignored() {
    let h = Harness::new();
    h.activate();

    let id = h.session.capture(CaptureOptions::default());
    h.camera.expose();
    h.wait_for(|e| matches!(e, SessionEvent::ImageExposed(got) if *got == id));
    assert!(!h.session.cancel_capture());

    h.camera.deliver();
    h.wait_for(|e| matches!(e, SessionEvent::ImageSaved { id: got, .. } if *got == id));
}

#[test]
fn test_capture_while_not_ready_is_refused() {
    let h = Harness::new();
    h.session.open();
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));

    let first = h.session.capture(CaptureOptions::default());
    let (event, _) = h.wait_for(|e| matches!(e, SessionEvent::ImageCaptureError { .. }));
    assert!(matches!(
        event,
        SessionEvent::ImageCaptureError { id, code: ErrorCode::NotReady, ref message }
            if id == first && message == "Camera not ready"
    ));

    let second = h.session.capture(CaptureOptions::default());
    assert!(second > first);
    h.wait_for(|e| matches!(e, SessionEvent::ImageCaptureError { id, .. } if *id == second));
    assert_eq!(h.camera.count("take_picture"), 0);
}

#[test]
fn test_second_capture_while_busy_is_refused() {
    let h = Harness::new();
    h.activate();

    let first = h.session.capture(CaptureOptions::default());
    let second = h.session.capture(CaptureOptions::default());
    assert!(second > first);
    h.wait_for(|e| {
        matches!(e, SessionEvent::ImageCaptureError { id, code: ErrorCode::NotReady, .. } if *id == second)
    });
    assert_eq!(h.camera.count("take_picture"), 1);
    assert_eq!(h.session.capture_status(first), Some(CaptureStatus::Pending));
}

#[test]
fn test_failed_capture_restarts_the_preview() {
    let h = Harness::new();
    h.activate();
    h.camera.fail_take_picture.store(true, Ordering::SeqCst);

    let id = h.session.capture(CaptureOptions::default());
    let (event, _) = h.wait_for(|e| matches!(e, SessionEvent::ImageCaptureError { .. }));
    assert!(matches!(
        event,
        SessionEvent::ImageCaptureError { id: got, code: ErrorCode::Resource, ref message }
            if got == id && message == "Failed to capture image"
    ));

    h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    assert_eq!(h.camera.count("start_preview"), 2);
    assert_eq!(h.session.capture_status(id), Some(CaptureStatus::Failed));
}

#[test]
fn test_slow_shutter_times_out_without_wedging_the_session() {
    let h = Harness::with_config(
        SessionConfig::default().with_blocking_timeout(Duration::from_millis(100)),
    );
    h.activate();
    h.camera.take_picture_delay_ms.store(400, Ordering::SeqCst);

    let started = Instant::now();
    let id = h.session.capture(CaptureOptions::default());
    assert!(started.elapsed() < Duration::from_millis(400));

    h.wait_for(|e| {
        matches!(e, SessionEvent::ImageCaptureError { id: got, code: ErrorCode::Resource, .. } if *got == id)
    });
    h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    assert_eq!(h.session.state(), SessionState::Active);
}

#[test]
fn test_close_fails_the_capture_in_flight() {
    let h = Harness::new();
    h.activate();

    let id = h.session.capture(CaptureOptions::default());
    h.session.close();

    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.camera.count("release"), 1);
    h.wait_for(|e| {
        matches!(e, SessionEvent::ImageCaptureError { id: got, code: ErrorCode::Resource, .. } if *got == id)
    });
    assert_eq!(h.session.capture_status(id), Some(CaptureStatus::Canceled));

    // Late native callbacks from the released camera are ignored.
    h.camera.deliver();
    let late = h.drain(Duration::from_millis(100));
    assert!(late.iter().all(|e| !matches!(e, SessionEvent::ImageSaved { .. })));
}

#[test]
fn test_preview_failure_falls_back_to_loaded() {
    let h = Harness::new();
    h.camera.fail_preview.store(true, Ordering::SeqCst);
    let output = FakeVideoOutput::new(true);
    let dyn_output: Arc<dyn VideoOutput> = output.clone();
    h.session.bind_video_output(&dyn_output);
    h.session.set_state(CameraState::Active);

    let (event, _) = h.wait_for(|e| matches!(e, SessionEvent::Error { .. }));
    assert!(matches!(
        event,
        SessionEvent::Error { code: ErrorCode::Camera, ref message }
            if message == "Camera preview failed to start."
    ));
    assert_eq!(h.session.state(), SessionState::Loaded);
    assert_eq!(h.session.target_state(), CameraState::Loaded);
    assert!(!output.is_running());
}

#[test]
fn test_recorder_handoff_round_trip() {
    let h = Harness::new();
    h.activate();

    let handoff = h.session.begin_recorder_handoff().unwrap();
    assert_eq!(
        handoff.handle.downcast_ref::<String>().map(String::as_str),
        Some("fake-recorder")
    );
    assert_eq!(handoff.orientation_hint, 90);
    assert!(h.session.is_recorder_handoff_active());
    assert!(h.session.begin_recorder_handoff().is_err());

    let id = h.session.capture(CaptureOptions::default());
    h.wait_for(|e| {
        matches!(e, SessionEvent::ImageCaptureError { id: got, code: ErrorCode::Resource, .. } if *got == id)
    });

    h.session.end_recorder_handoff().unwrap();
    h.wait_for(|e| matches!(e, SessionEvent::ReadyForCaptureChanged(true)));
    assert!(!h.session.is_recorder_handoff_active());

    let unlock = h.camera.position("unlock").unwrap();
    let reconnect = h.camera.position("reconnect").unwrap();
    let lock = h.camera.position("lock").unwrap();
    assert!(unlock < reconnect && reconnect < lock);
}

#[test]
fn test_failed_reconnect_leaves_the_camera_loaded() {
    let h = Harness::new();
    h.activate();
    h.camera.fail_reconnect.store(true, Ordering::SeqCst);

    h.session.begin_recorder_handoff().unwrap();
    h.session
        .apply_image_settings(ImageSettings::default().with_resolution(Size::new(640, 480)))
        .unwrap();
    h.session.adjust_preview_size(Size::new(640, 480));
    assert!(h.session.end_recorder_handoff().is_err());

    let (event, _) = h.wait_for(|e| matches!(e, SessionEvent::Error { .. }));
    match event {
        SessionEvent::Error { code, message } => {
            assert_eq!(code, ErrorCode::Camera);
            assert!(message.starts_with("Could not reconnect to camera"));
        },
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.session.state(), SessionState::Loaded);
    assert_eq!(h.session.target_state(), CameraState::Loaded);

    // Work queued for the recorder is dropped, not sent to the lost device.
    let late = h.drain(Duration::from_millis(100));
    assert!(late.iter().all(|e| !matches!(e, SessionEvent::Error { .. })));
    assert_eq!(h.camera.calls_after("reconnect"), Vec::<String>::new());
    assert_eq!(h.session.parameters().unwrap().picture_size, Size::new(1920, 1080));
}

#[test]
fn test_stopping_during_handoff_leaves_the_device_alone() {
    let h = Harness::new();
    let output = h.activate();

    h.session.begin_recorder_handoff().unwrap();
    let probe = h.session.add_frame_probe(Arc::new(|_: &Frame| {}));
    h.session.set_state(CameraState::Loaded);
    assert_eq!(h.session.state(), SessionState::Loaded);
    assert!(!output.is_running());
    let _ = h.drain(Duration::from_millis(100));
    assert_eq!(h.camera.calls_after("unlock"), Vec::<String>::new());

    h.session.end_recorder_handoff().unwrap();
    h.until(|| h.camera.count("notify_new_frames(true)") == 1);
    let after = h.camera.calls_after("lock");
    assert!(after.contains(&"detach_preview_target".to_string()), "{after:?}");
    assert_eq!(h.camera.count("start_preview"), 1);
    assert_eq!(h.session.state(), SessionState::Loaded);
    assert!(!h.session.is_ready_for_capture());
    assert!(h.session.remove_frame_probe(probe));
}

#[test]
fn test_stopping_during_capture_keeps_the_preview_down() {
    let h = Harness::new();
    h.activate();

    let id = h.session.capture(CaptureOptions::default());
    h.session.set_state(CameraState::Loaded);
    h.camera.expose();
    h.camera.deliver();
    h.wait_for(|e| matches!(e, SessionEvent::ImageSaved { id: got, .. } if *got == id));
    let late = h.drain(Duration::from_millis(150));

    assert!(late.iter().all(|e| !matches!(e, SessionEvent::ReadyForCaptureChanged(true))));
    assert_eq!(h.session.state(), SessionState::Loaded);
    assert_eq!(h.camera.count("start_preview"), 1);
    let stop = h.camera.position("stop_preview").unwrap();
    assert!(h.camera.calls()[stop..].iter().all(|c| c != "start_preview"));
}

#[test]
fn test_work_deferred_before_close_is_never_replayed() {
    let h = Harness::new();
    h.session.set_state(CameraState::Active);
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));
    h.session.close();
    assert_eq!(h.session.state(), SessionState::Closed);
    let _ = h.drain(Duration::from_millis(50));

    let output = FakeVideoOutput::new(true);
    let dyn_output: Arc<dyn VideoOutput> = output.clone();
    h.session.bind_video_output(&dyn_output);
    let late = h.drain(Duration::from_millis(150));

    assert!(state_changes(&late).is_empty(), "{late:?}");
    assert_eq!(h.camera.count("open"), 1);
    assert_eq!(h.camera.count("start_preview"), 0);
    assert_eq!(h.session.state(), SessionState::Closed);
    assert!(!output.is_running());
}

#[test]
fn test_settings_wait_for_the_recorder() {
    let h = Harness::new();
    h.activate();
    let largest = h.session.parameters().unwrap().picture_size;
    assert_eq!(largest, Size::new(1920, 1080));

    h.session.begin_recorder_handoff().unwrap();
    h.session
        .apply_image_settings(ImageSettings::default().with_resolution(Size::new(640, 480)))
        .unwrap();
    assert_eq!(h.session.parameters().unwrap().picture_size, largest);

    h.session.end_recorder_handoff().unwrap();
    assert_eq!(h.session.parameters().unwrap().picture_size, Size::new(640, 480));
}

#[test]
fn test_non_jpeg_settings_are_rejected() {
    let h = Harness::new();
    let err = h
        .session
        .apply_image_settings(ImageSettings::default().with_format(image::ImageFormat::Png))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Format);
}

#[test]
fn test_settings_requested_while_closed_apply_on_open() {
    let h = Harness::new();
    h.session
        .apply_image_settings(ImageSettings::default().with_resolution(Size::new(1280, 720)))
        .unwrap();
    h.session.open();
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));
    assert_eq!(h.session.parameters().unwrap().picture_size, Size::new(1280, 720));
}

#[test]
fn test_suspension_releases_and_resume_restores() {
    let h = Harness::new();
    h.activate();

    h.session.application_suspended();
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.camera.count("release"), 1);

    // Requests made while suspended are only remembered.
    h.session.set_state(CameraState::Loaded);
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.camera.count("open"), 1);

    h.session.application_resumed();
    h.wait_for(|e| matches!(e, SessionEvent::StatusChanged(SessionState::Loaded)));
    assert_eq!(h.session.target_state(), CameraState::Loaded);
    assert_eq!(h.camera.count("open"), 2);
}

#[test]
fn test_keep_alive_survives_suspension() {
    let h = Harness::new();
    h.activate();
    h.session.set_keep_alive(true);

    h.session.application_suspended();
    h.session.application_resumed();
    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(h.camera.count("release"), 0);
}

#[test]
fn test_rotation_transposes_the_output_size() {
    let h = Harness::new();
    let output = h.activate();

    // Sensor mounted at 90 degrees, device upright.
    assert_eq!(h.session.camera_rotation(), Some(90));
    assert_eq!(output.video_size(), Some(Size::new(720, 1280)));
    let params = h.session.parameters().unwrap();
    assert_eq!(params.preview_size, Size::new(1280, 720));
    assert_eq!(params.display_orientation, 90);

    h.session.set_device_rotation(90);
    assert_eq!(h.session.camera_rotation(), Some(0));
    assert_eq!(output.video_size(), Some(Size::new(1280, 720)));
    assert_eq!(h.session.parameters().unwrap().display_orientation, 0);
}

#[test]
fn test_frame_probes_toggle_frame_delivery() {
    let h = Harness::new();
    h.activate();

    let (tx, rx) = mpsc::channel();
    let probe = h.session.add_frame_probe(Arc::new(move |frame: &Frame| {
        let _ = tx.send(frame.size());
    }));
    h.until(|| h.camera.count("notify_new_frames(true)") == 1);

    let frame = Frame::new_rgb8(Bytes::from(vec![0u8; 6 * 4 * 3]), 6, 4, 18);
    h.camera.events().new_preview_frame(&frame);
    assert_eq!(rx.recv_timeout(support::WAIT).unwrap(), Size::new(6, 4));

    assert!(h.session.remove_frame_probe(probe));
    assert!(!h.session.remove_frame_probe(probe));
    h.until(|| h.camera.count("notify_new_frames(false)") == 2);
}
