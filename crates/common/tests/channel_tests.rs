//! Integration tests for the note channel
//!
//! Exercises the sink the way the host uses it: a producer thread standing in
//! for USB completion callbacks and a consumer on the other side.

use common::{EventSink, SendOutcome, create_note_channel};
use protocol::NoteEvent;
use std::thread;

#[test]
fn test_blocking_consumer_sees_notes_in_order() {
    let sink = EventSink::new();
    let (tx, rx) = create_note_channel(16);
    sink.bind(tx);

    let producer = {
        let sink = sink.clone();
        thread::spawn(move || {
            for pitch in 48..60 {
                assert_eq!(sink.try_send(NoteEvent { pitch }), SendOutcome::Sent);
            }
        })
    };
    producer.join().unwrap();

    let received: Vec<u8> = (0..12).map(|_| rx.recv_blocking().unwrap().pitch).collect();
    assert_eq!(received, (48..60).collect::<Vec<u8>>());
}

#[test]
fn test_consumer_ends_when_sink_unbinds() {
    let sink = EventSink::new();
    let (tx, rx) = create_note_channel(4);
    sink.bind(tx);

    assert_eq!(sink.try_send(NoteEvent { pitch: 72 }), SendOutcome::Sent);
    sink.unbind();

    // Queued notes are still delivered, then the channel reports closed
    assert_eq!(rx.recv_blocking().unwrap(), NoteEvent { pitch: 72 });
    assert!(rx.recv_blocking().is_err());
}

#[test]
fn test_rebind_switches_consumer() {
    let sink = EventSink::new();
    let (first_tx, first_rx) = create_note_channel(4);
    let (second_tx, second_rx) = create_note_channel(4);

    sink.bind(first_tx);
    sink.try_send(NoteEvent { pitch: 60 });
    sink.bind(second_tx);
    sink.try_send(NoteEvent { pitch: 61 });

    assert_eq!(first_rx.try_recv(), Some(NoteEvent { pitch: 60 }));
    assert_eq!(first_rx.try_recv(), None);
    assert_eq!(second_rx.try_recv(), Some(NoteEvent { pitch: 61 }));
}

#[test]
fn test_small_capacity_drops_overflow() {
    let sink = EventSink::new();
    let (tx, rx) = create_note_channel(1);
    sink.bind(tx);

    let outcomes: Vec<SendOutcome> = (0..3)
        .map(|i| sink.try_send(NoteEvent { pitch: 60 + i }))
        .collect();

    assert_eq!(
        outcomes,
        vec![SendOutcome::Sent, SendOutcome::Full, SendOutcome::Full]
    );
    assert_eq!(rx.len(), 1);
}
