// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming fan-out specs.

use crate::prelude::{draft, Engine};
use retrace_core::{EventKind, SessionId};
use retrace_stream::{BackpressureConfig, OutboundQueue, QueueState};

#[test]
fn subscribers_see_events_in_timestamp_id_order() {
    let engine = Engine::start();
    engine.create_session("S", 0);
    let (_handle, mut feed) = engine.hub.subscribe(SessionId::new("S"), 64);

    for t in 1..=10 {
        engine.ingest_event(draft(&format!("ev-{t:02}"), "S", EventKind::TaskStart, t));
    }

    let mut last = (i64::MIN, String::new());
    for _ in 0..10 {
        let event = feed.try_recv().unwrap();
        let key = (event.timestamp, event.id.as_str().to_string());
        assert!(key > last, "events must arrive in (timestamp, id) order");
        last = key;
    }
}

#[test]
fn agent_filter_narrows_live_delivery() {
    let engine = Engine::start();
    engine.create_session("S", 0);
    let (handle, mut feed) = engine.hub.subscribe(SessionId::new("S"), 64);
    handle.set_agent_filter(Some(vec!["agent-2".into()]));

    let mut from_one = draft("e1", "S", EventKind::TaskStart, 1);
    from_one.agent_id = Some("agent-1".to_string());
    engine.ingest_event(from_one);

    let mut from_two = draft("e2", "S", EventKind::TaskStart, 2);
    from_two.agent_id = Some("agent-2".to_string());
    engine.ingest_event(from_two);

    let got = feed.try_recv().unwrap();
    assert_eq!(got.id, "e2");
    assert!(feed.try_recv().is_err());
}

#[test]
fn backpressure_drop_oldest_with_stalled_reader() {
    // Subscriber with max_queue_size=3 and drop_oldest, reader stalled.
    let mut queue: OutboundQueue<String> = OutboundQueue::new(BackpressureConfig {
        high_watermark_bytes: usize::MAX,
        low_watermark_bytes: 0,
        max_queue_frames: 3,
        drop_oldest: true,
    });

    // 10 events published while the reader is stalled.
    for i in 1..=10 {
        queue.push(format!("ev-{i}"), 100);
    }

    // Reader resumes: the last 3 events arrive.
    assert_eq!(queue.pop().as_deref(), Some("ev-8"));
    assert_eq!(queue.pop().as_deref(), Some("ev-9"));
    assert_eq!(queue.pop().as_deref(), Some("ev-10"));
    assert_eq!(queue.pop(), None);

    // The heartbeat metric reflects the drops.
    assert!(queue.dropped() >= 7);
}

#[test]
fn byte_watermarks_gate_live_pull() {
    let mut queue: OutboundQueue<&'static str> = OutboundQueue::new(BackpressureConfig {
        high_watermark_bytes: 300,
        low_watermark_bytes: 100,
        max_queue_frames: 1000,
        drop_oldest: true,
    });

    queue.push("a", 150);
    assert_eq!(queue.state(), QueueState::Streaming);
    queue.push("b", 150);
    assert_eq!(queue.state(), QueueState::Backpressured);

    queue.pop();
    queue.pop();
    assert_eq!(queue.state(), QueueState::Streaming);
}

#[test]
fn hub_counts_feed_drops_for_heartbeat_metrics() {
    let engine = Engine::start();
    engine.create_session("S", 0);

    // Tiny feed channel, no consumer pulling.
    let (_handle, _feed) = engine.hub.subscribe(SessionId::new("S"), 2);
    for t in 1..=10 {
        engine.ingest_event(draft(&format!("ev-{t}"), "S", EventKind::TaskStart, t));
    }

    let metrics = engine.hub.metrics();
    assert_eq!(metrics.published, 10);
    assert_eq!(metrics.delivered, 2);
    assert_eq!(metrics.dropped, 8);
}

#[test]
fn publishing_without_subscribers_is_harmless() {
    let engine = Engine::start();
    engine.create_session("S", 0);
    engine.ingest_event(draft("e1", "S", EventKind::TaskStart, 1));
    assert_eq!(engine.hub.metrics().delivered, 0);

    // Late subscriber only sees later events.
    let (_handle, mut feed) = engine.hub.subscribe(SessionId::new("S"), 8);
    engine.ingest_event(draft("e2", "S", EventKind::TaskStart, 2));
    assert_eq!(feed.try_recv().unwrap().id, "e2");
}
