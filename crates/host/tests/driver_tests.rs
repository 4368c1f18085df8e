//! Integration tests for the driver against the in-memory session
//!
//! Each test drives the poller by hand with `poll_once`, so every step of a
//! device's life is deterministic: discovery, the lifecycle chain, stream
//! completions, disconnects and teardown.

use common::{NoteReceiver, create_note_channel};
use host::config::{DeviceProfile, DriverSettings, FatalPolicy};
use host::usb::mock::{MockCall, MockOp, MockSession};
use host::usb::{
    Action, ActionSet, DeviceHandle, Driver, DriverError, HostError, SlotId, TransferId,
    TransferStatus, spawn_poller,
};
use protocol::NoteEvent;
use std::sync::Arc;
use std::time::Duration;

const NOTE_ON_C4: [u8; 4] = [0x09, 0x00, 0x3C, 0x00];

fn driver(session: &Arc<MockSession>, settings: DriverSettings) -> Driver<MockSession> {
    Driver::new(session.clone(), settings, DeviceProfile::default()).unwrap()
}

fn streaming_driver(addresses: &[u8]) -> (Arc<MockSession>, Driver<MockSession>, NoteReceiver) {
    let session = Arc::new(MockSession::with_devices(addresses));
    let driver = driver(&session, DriverSettings::default());
    let (tx, rx) = create_note_channel(16);
    driver.set_note_sender(tx);

    driver.poll_once().unwrap();
    assert!(driver.slots().iter().filter(|s| s.is_occupied()).all(|s| s.is_streaming()));
    (session, driver, rx)
}

fn stream_of(driver: &Driver<MockSession>, slot: usize) -> TransferId {
    driver.slots()[slot].stream_transfer.unwrap()
}

fn open_count(session: &MockSession) -> usize {
    session
        .calls()
        .iter()
        .filter(|c| matches!(c, MockCall::Open(_)))
        .count()
}

#[test]
fn test_end_to_end_note_and_disconnect() {
    let (session, driver, rx) = streaming_driver(&[5]);

    let slot = &driver.slots()[0];
    assert_eq!(slot.address, 5);
    let handle = slot.handle.unwrap();
    let transfer = slot.stream_transfer.unwrap();
    assert_eq!(
        session.calls(),
        vec![
            MockCall::Open(5),
            MockCall::DeviceInfo(handle),
            MockCall::ConfigDescriptor(handle),
            MockCall::Claim(handle, 3),
            MockCall::Alloc(transfer),
            MockCall::Submit(transfer),
        ]
    );

    assert!(session.complete(transfer, TransferStatus::Completed, &NOTE_ON_C4));
    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));
    assert_eq!(rx.try_recv(), None);
    assert_eq!(session.submit_count(), 2);

    session.detach(5);
    session.clear_calls();

    // Removal is delivered while pumping, Close runs on the next cycle
    driver.poll_once().unwrap();
    assert_eq!(driver.slots()[0].pending, ActionSet::only(Action::Close));
    driver.poll_once().unwrap();

    assert!(!driver.slots()[0].is_occupied());
    assert_eq!(
        session.calls(),
        vec![
            MockCall::Free(transfer),
            MockCall::Release(handle, 3),
            MockCall::Close(handle),
        ]
    );
    assert_eq!(session.free_count(), 1);
    assert!(session.open_handles().is_empty());
    assert!(session.live_transfers().is_empty());
}

#[test]
fn test_notes_in_frame_order() {
    let (session, driver, rx) = streaming_driver(&[5]);
    let transfer = stream_of(&driver, 0);

    let payload = [
        0x09, 0x90, 0x3C, 0x40, // note on 60
        0x08, 0x80, 0x3E, 0x40, // note off
        0x09, 0x90, 0x00, 0x40, // zero pitch byte
        0x19, 0x90, 0x40, 0x7F, // note on 64, cable 1
        0x0B, 0xB0, 0x07, 0x64, // control change
        0x09, 0x90, // truncated
    ];
    session.complete(transfer, TransferStatus::Completed, &payload);

    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));
    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 64 }));
    assert_eq!(rx.try_recv(), None);
    assert_eq!(driver.stats().notes_forwarded, 2);
}

#[test]
fn test_every_non_terminal_completion_resubmits() {
    let (session, driver, _rx) = streaming_driver(&[5]);
    let transfer = stream_of(&driver, 0);

    let statuses = [
        TransferStatus::Completed,
        TransferStatus::Error,
        TransferStatus::Stall,
        TransferStatus::Overflow,
        TransferStatus::Completed,
    ];
    for status in statuses {
        assert!(session.complete(transfer, status, &[]));
    }

    assert_eq!(session.submit_count(), 1 + statuses.len());
    let stats = driver.stats();
    assert_eq!(stats.resubmissions, statuses.len() as u64);
    assert_eq!(stats.stream_errors, 3);

    // Terminal statuses leave the transfer idle
    assert!(session.complete(transfer, TransferStatus::Canceled, &[]));
    assert!(!session.complete(transfer, TransferStatus::Completed, &NOTE_ON_C4));
    assert_eq!(session.submit_count(), 1 + statuses.len());
}

#[test]
fn test_terminal_statuses_are_not_stream_errors() {
    for status in [TransferStatus::NoDevice, TransferStatus::Canceled] {
        let (session, driver, _rx) = streaming_driver(&[5]);
        let transfer = stream_of(&driver, 0);

        assert!(session.complete(transfer, status, &NOTE_ON_C4));

        assert_eq!(session.submit_count(), 1, "{:?} was resubmitted", status);
        let stats = driver.stats();
        assert_eq!(stats.stream_errors, 0);
        assert_eq!(stats.notes_forwarded, 0);
        assert!(session.armed_transfers().is_empty());
    }
}

#[test]
fn test_unbound_sink_drops_notes_but_keeps_streaming() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    driver.poll_once().unwrap();

    let transfer = stream_of(&driver, 0);
    session.complete(transfer, TransferStatus::Completed, &NOTE_ON_C4);
    assert_eq!(driver.stats().notes_dropped, 1);
    assert_eq!(session.submit_count(), 2);

    // Binding later takes effect for the next completion
    let (tx, rx) = create_note_channel(4);
    driver.set_note_sender(tx);
    session.complete(transfer, TransferStatus::Completed, &NOTE_ON_C4);
    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));
}

#[test]
fn test_full_sink_drops_without_blocking() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    let (tx, rx) = create_note_channel(1);
    driver.set_note_sender(tx);
    driver.poll_once().unwrap();

    let transfer = stream_of(&driver, 0);
    let payload = [0x09, 0x90, 0x3C, 0x40, 0x09, 0x90, 0x40, 0x40];
    session.complete(transfer, TransferStatus::Completed, &payload);

    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));
    assert_eq!(rx.try_recv(), None);
    let stats = driver.stats();
    assert_eq!(stats.notes_forwarded, 1);
    assert_eq!(stats.notes_dropped, 1);
}

#[test]
fn test_completion_only_touches_its_slot() {
    let (session, driver, rx) = streaming_driver(&[5, 7]);
    let before = driver.slots();

    session.complete(stream_of(&driver, 1), TransferStatus::Completed, &NOTE_ON_C4);

    assert_eq!(driver.slots(), before);
    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));
}

#[test]
fn test_repeated_discovery_does_not_reallocate() {
    let (session, driver, _rx) = streaming_driver(&[5, 7]);

    for _ in 0..5 {
        driver.poll_once().unwrap();
    }

    assert_eq!(open_count(&session), 2);
    let addresses: Vec<u8> = driver.slots().iter().map(|s| s.address).collect();
    assert_eq!(addresses, vec![5, 7, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_discovery_is_bounded_by_capacity() {
    let session = Arc::new(MockSession::with_devices(&[1, 2, 3]));
    let driver = driver(
        &session,
        DriverSettings {
            slot_capacity: 2,
            ..DriverSettings::default()
        },
    );

    driver.poll_once().unwrap();
    let addresses: Vec<u8> = driver.slots().iter().map(|s| s.address).collect();
    assert_eq!(addresses, vec![1, 2]);

    // A freed slot goes to the device that did not fit
    session.detach(1);
    driver.poll_once().unwrap();
    driver.poll_once().unwrap();
    driver.poll_once().unwrap();
    let addresses: Vec<u8> = driver.slots().iter().map(|s| s.address).collect();
    assert_eq!(addresses, vec![3, 2]);
    assert!(driver.slots()[0].is_streaming());
}

#[test]
fn test_disconnect_from_event_context() {
    let (session, driver, _rx) = streaming_driver(&[5]);
    let handle = driver.slots()[0].handle.unwrap();

    session.detach_now(5);
    assert_eq!(driver.slots()[0].pending, ActionSet::only(Action::Close));

    session.clear_calls();
    driver.poll_once().unwrap();
    assert!(!driver.slots()[0].is_occupied());
    assert!(session.calls().contains(&MockCall::Close(handle)));
}

#[test]
fn test_disconnect_during_bring_up() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.detach_on(MockOp::DeviceInfo, 5);

    driver.poll_once().unwrap();

    let handle = DeviceHandle(1);
    assert_eq!(
        session.calls(),
        vec![
            MockCall::Open(5),
            MockCall::DeviceInfo(handle),
            MockCall::Close(handle),
        ]
    );
    assert!(!driver.slots()[0].is_occupied());
}

#[test]
fn test_vanished_before_open_is_retried() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::Open, HostError::NoDevice);

    driver.poll_once().unwrap();
    assert!(!driver.slots()[0].is_occupied());

    driver.poll_once().unwrap();
    assert!(driver.slots()[0].is_streaming());
    assert_eq!(open_count(&session), 2);
}

#[test]
fn test_claim_failure_is_not_retried_by_default() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::Claim, HostError::Busy);

    driver.poll_once().unwrap();
    session.clear_calls();
    driver.poll_once().unwrap();
    driver.poll_once().unwrap();

    let slot = &driver.slots()[0];
    assert_eq!(slot.address, 5);
    assert!(slot.handle.is_some());
    assert!(!slot.is_streaming());
    assert!(session.calls().is_empty());
}

#[test]
fn test_failed_query_abandons_bring_up() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::DeviceInfo, HostError::Io);

    driver.poll_once().unwrap();
    driver.poll_once().unwrap();

    let handle = driver.slots()[0].handle.unwrap();
    assert_eq!(
        session.calls(),
        vec![MockCall::Open(5), MockCall::DeviceInfo(handle)]
    );
    assert!(!driver.slots()[0].is_streaming());
    assert!(session.claimed_interfaces().is_empty());
    assert!(session.live_transfers().is_empty());
}

#[test]
fn test_failed_config_descriptor_abandons_bring_up() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::ConfigDescriptor, HostError::Pipe);

    driver.poll_once().unwrap();

    assert!(
        !session
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Claim(..) | MockCall::Alloc(_) | MockCall::Submit(_)))
    );
    assert!(!driver.slots()[0].is_streaming());
}

#[test]
fn test_filtered_devices_are_never_opened() {
    let session = Arc::new(MockSession::new());
    session.attach_device(2, 0x046d, 0x0825); // webcam
    session.attach(5);
    session.attach_device(9, 0x0582, 0x012a);
    let driver = driver(&session, DriverSettings::default());

    driver.poll_once().unwrap();
    driver.poll_once().unwrap();

    let opened: Vec<MockCall> = session
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::Open(_)))
        .collect();
    assert_eq!(opened, vec![MockCall::Open(5)]);
    assert!(
        session
            .claimed_interfaces()
            .iter()
            .all(|(handle, _)| *handle == driver.slots()[0].handle.unwrap())
    );
    assert_eq!(
        driver.slots().iter().filter(|s| s.is_occupied()).count(),
        1
    );
}

#[test]
fn test_filters_do_not_consume_slots() {
    let session = Arc::new(MockSession::new());
    for address in 1..=4 {
        session.attach_device(address, 0x046d, 0x0800 + address as u16);
    }
    session.attach(7);
    let driver = driver(
        &session,
        DriverSettings {
            slot_capacity: 2,
            ..DriverSettings::default()
        },
    );

    driver.poll_once().unwrap();
    assert_eq!(driver.slots()[0].address, 7);
    assert!(driver.slots()[0].is_streaming());
}

#[test]
fn test_empty_filter_list_allows_every_device() {
    let session = Arc::new(MockSession::new());
    session.attach_device(2, 0x046d, 0x0825);
    let profile = DeviceProfile {
        filters: Vec::new(),
        ..DeviceProfile::default()
    };
    let driver = Driver::new(session.clone(), DriverSettings::default(), profile).unwrap();

    driver.poll_once().unwrap();
    assert!(driver.slots()[0].is_streaming());
}

#[test]
fn test_claim_retry_limit() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(
        &session,
        DriverSettings {
            claim_retry_limit: 2,
            ..DriverSettings::default()
        },
    );
    for _ in 0..3 {
        session.fail_next(MockOp::Claim, HostError::Busy);
    }

    for _ in 0..5 {
        driver.poll_once().unwrap();
    }

    // Two close/open cycles, then the third failure parks the slot
    assert_eq!(open_count(&session), 3);
    let slot = &driver.slots()[0];
    assert_eq!(slot.address, 5);
    assert!(!slot.is_streaming());
    assert_eq!(session.open_handles().len(), 1);
}

#[test]
fn test_claim_retry_recovers() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(
        &session,
        DriverSettings {
            claim_retry_limit: 3,
            ..DriverSettings::default()
        },
    );
    session.fail_next(MockOp::Claim, HostError::Busy);

    driver.poll_once().unwrap();
    driver.poll_once().unwrap();

    assert!(driver.slots()[0].is_streaming());
    assert_eq!(open_count(&session), 2);
    assert_eq!(session.open_handles().len(), 1);
}

#[test]
fn test_fatal_open_aborts() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(
        &session,
        DriverSettings {
            fatal_policy: FatalPolicy::Abort,
            ..DriverSettings::default()
        },
    );
    session.fail_next(MockOp::Open, HostError::Access);

    let err = driver.poll_once().unwrap_err();
    assert!(matches!(
        err,
        DriverError::Fatal {
            slot: SlotId(0),
            operation: "open",
            source: HostError::Access,
        }
    ));
}

#[test]
fn test_fatal_open_quarantines_until_device_leaves() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::Open, HostError::Access);

    driver.poll_once().unwrap();
    driver.poll_once().unwrap();
    assert!(driver.slots()[0].quarantined);
    assert_eq!(open_count(&session), 1);

    session.detach(5);
    driver.poll_once().unwrap();
    assert!(!driver.slots()[0].is_occupied());

    session.attach(5);
    driver.poll_once().unwrap();
    assert!(driver.slots()[0].is_streaming());
    assert_eq!(open_count(&session), 2);
}

#[test]
fn test_quarantined_device_beyond_capacity_stays_parked() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(
        &session,
        DriverSettings {
            slot_capacity: 1,
            ..DriverSettings::default()
        },
    );
    session.fail_next(MockOp::Open, HostError::Access);
    driver.poll_once().unwrap();
    assert!(driver.slots()[0].quarantined);

    // Another device now enumerates ahead of the parked one
    session.attach(3);
    session.detach(5);
    session.attach(5);
    driver.poll_once().unwrap();
    driver.poll_once().unwrap();

    let slot = &driver.slots()[0];
    assert!(slot.quarantined);
    assert_eq!(slot.address, 5);
    assert_eq!(open_count(&session), 1);
}

#[test]
fn test_fatal_close_policies() {
    for policy in [FatalPolicy::Quarantine, FatalPolicy::Abort] {
        let session = Arc::new(MockSession::with_devices(&[5]));
        let driver = driver(
            &session,
            DriverSettings {
                fatal_policy: policy,
                ..DriverSettings::default()
            },
        );
        driver.poll_once().unwrap();

        session.fail_next(MockOp::Close, HostError::Io);
        assert!(driver.request_close(5));
        let result = driver.process_pending();

        match policy {
            FatalPolicy::Quarantine => assert!(result.is_ok()),
            FatalPolicy::Abort => assert!(matches!(
                result,
                Err(DriverError::Fatal {
                    operation: "close",
                    ..
                })
            )),
        }
        assert!(!driver.slots()[0].is_occupied());
        assert_eq!(session.free_count(), 1);
    }
}

#[test]
fn test_request_close_unknown_address() {
    let (_session, driver, _rx) = streaming_driver(&[5]);
    assert!(!driver.request_close(9));
    assert!(!driver.request_close(0));
}

#[test]
fn test_list_failure_is_fatal() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::List, HostError::Io);

    assert!(matches!(
        driver.poll_once(),
        Err(DriverError::Session(HostError::Io))
    ));
}

#[test]
fn test_pump_failure_is_not_fatal() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = driver(&session, DriverSettings::default());
    session.fail_next(MockOp::Pump, HostError::Io);

    assert!(driver.poll_once().is_ok());
    assert!(driver.slots()[0].is_streaming());
}

#[test]
fn test_invalid_profile_rejected() {
    let session = Arc::new(MockSession::new());
    let profile = DeviceProfile {
        endpoint: 0x02,
        ..DeviceProfile::default()
    };
    let result = Driver::new(session.clone(), DriverSettings::default(), profile);
    assert!(matches!(result, Err(DriverError::Config(_))));
    assert!(!session.has_client());
}

#[test]
fn test_shutdown_closes_everything() {
    let (session, driver, _rx) = streaming_driver(&[5, 7]);

    driver.shutdown().unwrap();

    assert!(driver.slots().iter().all(|s| !s.is_occupied()));
    assert_eq!(session.free_count(), 2);
    assert!(session.open_handles().is_empty());
    assert!(session.claimed_interfaces().is_empty());
    assert!(!session.has_client());
}

#[test]
fn test_poller_thread_runs_until_stopped() {
    let session = Arc::new(MockSession::with_devices(&[5]));
    let driver = Arc::new(driver(
        &session,
        DriverSettings {
            poll_interval_ms: 5,
            ..DriverSettings::default()
        },
    ));
    let (tx, rx) = create_note_channel(4);
    driver.set_note_sender(tx);

    let poller = spawn_poller(driver.clone()).unwrap();

    let mut waited = Duration::ZERO;
    while !driver.slots()[0].is_streaming() {
        assert!(waited < Duration::from_secs(5), "device never streamed");
        std::thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }

    session.complete(stream_of(&driver, 0), TransferStatus::Completed, &NOTE_ON_C4);
    assert_eq!(rx.try_recv(), Some(NoteEvent { pitch: 60 }));

    driver.stop();
    poller.join().unwrap().unwrap();

    assert!(!driver.slots()[0].is_occupied());
    assert!(session.open_handles().is_empty());
    assert!(!session.has_client());
}
