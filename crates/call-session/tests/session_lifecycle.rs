//! Integration tests for session startup, presence-driven dialing and
//! per-peer connection state.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use call_session::errors::CallError;
use call_session::registry::PeerTile;
use call_session::session::CallSession;
use call_session::signaling::{SignalMessage, SignalPayload};
use call_session::transport::TransportPhase;
use call_test_utils::*;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_start_publishes_presence_and_announces_identity() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("alice").await;

    let view = settle(&session).await;
    assert_eq!(view.phase, TransportPhase::Open);
    assert!(!view.signaling_degraded);
    assert_eq!(view.local_identity, identity("alice"));

    let published = rig.presence.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].identity, identity("alice"));

    assert_eq!(
        rig.signaling.announcements(),
        vec![(
            identity("alice"),
            SignalPayload::PeerId {
                peer_id: identity("alice")
            }
        )]
    );
}

#[tokio::test]
async fn test_account_key_is_sanitized_into_identity() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("alice@example.com").await;

    assert_eq!(
        session.current_view().local_identity,
        identity("alice-example-com")
    );
    assert_eq!(rig.transport.identities(), vec![identity("alice-example-com")]);
}

#[tokio::test]
async fn test_media_failure_is_fatal_to_start() {
    let rig = TestRig::new().with_media(MockMediaDevices::failing(CallError::MediaAcquisition(
        "permission denied".to_string(),
    )));

    let result = CallSession::start(
        session_args("alice"),
        test_settings(),
        rig.collaborators(),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(CallError::MediaAcquisition(_))));
    assert_eq!(rig.media.acquisitions(), 1);
    assert_eq!(rig.transport.allocation_count(), 0);
    assert!(rig.presence.published().is_empty());
}

#[tokio::test]
async fn test_view_always_includes_local_participant() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("alice").await;

    // Store has not caught up with the local record yet.
    rig.presence.push_snapshot(&["bob"]);
    let view = settle(&session).await;

    let local: Vec<_> = view.participants.iter().filter(|p| p.is_local).collect();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].record.identity, identity("alice"));
    assert_eq!(view.participants.len(), 2);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_present_peer_is_dialed_and_stream_fills_state() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    rig.presence.push_snapshot(&["a", "b"]);
    let view = settle(&session).await;

    let transport = rig.transport.latest();
    assert_eq!(transport.dials_to("b"), 1);
    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_none());
    assert!(!peer.reconnecting);

    transport.dial_to("b").deliver_stream(true, true);
    let view = settle(&session).await;

    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_some());
    assert!(!peer.reconnecting);
    assert_eq!(peer.tile(), PeerTile::Video);
}

#[tokio::test]
async fn test_stream_without_video_shows_camera_off() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;
    rig.transport.latest().dial_to("b").deliver_stream(true, false);
    let view = settle(&session).await;

    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(!peer.camera_on);
    assert!(peer.audio_on);
    assert_eq!(peer.tile(), PeerTile::CameraOff);
}

#[tokio::test]
async fn test_repeated_snapshots_do_not_redial() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    for _ in 0..5 {
        rig.presence.push_snapshot(&["a", "b", "c"]);
        settle(&session).await;
    }

    let transport = rig.transport.latest();
    assert_eq!(transport.dials_to("b"), 1);
    assert_eq!(transport.dials_to("c"), 1);
    assert_eq!(transport.dial_count(), 2);
}

#[tokio::test]
async fn test_rejoin_after_leave_never_overlaps_connections() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;
    rig.presence.push_snapshot(&["a"]);
    settle(&session).await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let dials = rig.transport.latest().dials();
    assert_eq!(dials.len(), 2);
    assert!(dials[0].is_closed());
    assert!(!dials[1].is_closed());
}

#[tokio::test]
async fn test_departed_peer_is_closed_and_removed() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    rig.presence.push_snapshot(&["a", "b", "c"]);
    settle(&session).await;
    rig.presence.push_snapshot(&["a", "c"]);
    let view = settle(&session).await;

    let transport = rig.transport.latest();
    assert!(transport.dial_to("b").is_closed());
    assert!(!transport.dial_to("c").is_closed());
    assert!(view.remote_peer(&identity("b")).is_none());
    assert!(view.remote_peer(&identity("c")).is_some());
}

#[tokio::test]
async fn test_no_dialing_before_transport_opens() {
    let rig = TestRig::new().with_transport(MockTransportFactory::new().without_auto_open());
    let (session, _task) = rig.start("a").await;

    rig.presence.push_snapshot(&["a", "b"]);
    let view = settle(&session).await;
    assert_eq!(view.phase, TransportPhase::Connecting);
    assert_eq!(rig.transport.latest().dial_count(), 0);
    assert!(view.remote_peer(&identity("b")).is_some());

    rig.transport.latest().open();
    settle(&session).await;
    assert_eq!(rig.transport.latest().dials_to("b"), 1);
}

#[tokio::test]
async fn test_repeated_open_announces_once_and_does_not_redial() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let transport = rig.transport.latest();
    transport.open();
    transport.open();
    settle(&session).await;

    assert_eq!(rig.signaling.announcement_count(), 1);
    assert_eq!(transport.dials_to("b"), 1);
}

#[tokio::test]
async fn test_peer_announcements_do_not_duplicate_dials() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    for _ in 0..3 {
        rig.signaling.push(SignalMessage::new(
            identity("b"),
            SignalPayload::PeerId {
                peer_id: identity("b"),
            },
        ));
    }
    settle(&session).await;

    assert_eq!(rig.transport.latest().dials_to("b"), 1);
}

// ============================================================================
// Connection events
// ============================================================================

#[tokio::test]
async fn test_remote_close_marks_reconnecting_without_redial() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let connection = rig.transport.latest().dial_to("b");
    connection.deliver_stream(true, true);
    connection.remote_close();
    let view = settle(&session).await;

    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_none());
    assert!(peer.reconnecting);
    assert_eq!(peer.tile(), PeerTile::Reconnecting);
    assert_eq!(rig.transport.latest().dials_to("b"), 1);

    // The next presence evaluation dials again.
    rig.presence.push_snapshot(&["a", "b"]);
    let view = settle(&session).await;
    assert_eq!(rig.transport.latest().dials_to("b"), 2);
    assert!(!view.remote_peer(&identity("b")).unwrap().reconnecting);
}

#[tokio::test]
async fn test_connection_error_behaves_like_close() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let connection = rig.transport.latest().dial_to("b");
    connection.deliver_stream(true, true);
    connection.fail("ice failed");
    let view = settle(&session).await;

    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_none());
    assert!(peer.reconnecting);
    assert!(view.fatal_notice.is_none());
    assert_eq!(view.phase, TransportPhase::Open);
}

// ============================================================================
// Inbound calls
// ============================================================================

#[tokio::test]
async fn test_inbound_call_is_answered_and_registered() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    let inbound = rig.transport.latest().incoming_call("c");
    inbound.deliver_stream(true, true);
    let view = settle(&session).await;

    assert!(inbound.was_answered());
    let peer = view.remote_peer(&identity("c")).unwrap();
    assert!(peer.stream.is_some());

    // Presence catching up does not dial a peer that already called in.
    rig.presence.push_snapshot(&["a", "c"]);
    settle(&session).await;
    assert_eq!(rig.transport.latest().dials_to("c"), 0);
}

#[tokio::test]
async fn test_inbound_call_replaces_dropped_connection() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let outbound = rig.transport.latest().dial_to("b");
    outbound.remote_close();
    settle(&session).await;

    let inbound = rig.transport.latest().incoming_call("b");
    inbound.deliver_stream(true, true);
    let view = settle(&session).await;

    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_some());
    assert!(!peer.reconnecting);

    // Events from the replaced connection no longer apply.
    outbound.fail("late error");
    let view = settle(&session).await;
    assert!(view.remote_peer(&identity("b")).unwrap().stream.is_some());
}

#[tokio::test]
async fn test_simultaneous_dial_leaves_one_open_connection_on_lower_side() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b"]);
    settle(&session).await;

    let transport = rig.transport.latest();
    let outbound = transport.dial_to("b");
    let inbound = transport.incoming_call("b");
    inbound.deliver_stream(true, true);
    settle(&session).await;
    outbound.deliver_stream(true, true);
    settle(&session).await;

    for _ in 0..5 {
        rig.presence.push_snapshot(&["a", "b"]);
        settle(&session).await;
    }
    let view = settle(&session).await;

    assert!(inbound.is_closed());
    assert!(!inbound.was_answered());
    assert!(!outbound.is_closed());
    assert_eq!(transport.dials_to("b"), 1);
    assert!(view.remote_peer(&identity("b")).unwrap().stream.is_some());
}

#[tokio::test]
async fn test_simultaneous_dial_leaves_one_open_connection_on_higher_side() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("c").await;
    rig.presence.push_snapshot(&["b", "c"]);
    settle(&session).await;

    let transport = rig.transport.latest();
    let outbound = transport.dial_to("b");
    let inbound = transport.incoming_call("b");
    inbound.deliver_stream(true, false);
    settle(&session).await;

    for _ in 0..5 {
        rig.presence.push_snapshot(&["b", "c"]);
        settle(&session).await;
    }
    let view = settle(&session).await;

    assert!(outbound.is_closed());
    assert!(inbound.was_answered());
    assert!(!inbound.is_closed());
    assert_eq!(transport.dials_to("b"), 1);
    let peer = view.remote_peer(&identity("b")).unwrap();
    assert!(peer.stream.is_some());
    assert!(!peer.camera_on);
}

#[tokio::test]
async fn test_inbound_call_from_self_is_ignored() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    let inbound = rig.transport.latest().incoming_call("a");
    let view = settle(&session).await;

    assert!(!inbound.was_answered());
    assert!(inbound.is_closed());
    assert!(view.remote_peers.is_empty());
}

#[tokio::test]
async fn test_refused_answer_is_not_fatal() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    let transport = rig.transport.latest();
    // The session has not processed the call yet.
    let refused = transport.incoming_call("b");
    refused.refuse_answer();
    let accepted = transport.incoming_call("c");
    let view = settle(&session).await;

    assert!(!refused.was_answered());
    assert!(refused.is_closed());
    assert!(view.remote_peer(&identity("b")).is_none());
    assert!(accepted.was_answered());
    assert!(view.fatal_notice.is_none());
    assert_eq!(view.phase, TransportPhase::Open);
}

// ============================================================================
// Local media
// ============================================================================

#[tokio::test]
async fn test_toggles_flip_local_tracks() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;

    session.toggle_audio().unwrap();
    let view = settle(&session).await;
    assert!(!view.audio_enabled);
    assert!(view.video_enabled);
    assert!(!session.local_stream().audio_enabled());

    session.toggle_video().unwrap();
    session.toggle_audio().unwrap();
    let view = settle(&session).await;
    assert!(view.audio_enabled);
    assert!(!view.video_enabled);
}

#[tokio::test]
async fn test_every_connection_shares_the_local_stream() {
    let rig = TestRig::new();
    let (session, _task) = rig.start("a").await;
    rig.presence.push_snapshot(&["a", "b", "c"]);
    settle(&session).await;

    assert_eq!(rig.media.acquisitions(), 1);
    assert_eq!(
        rig.media.last_stream().unwrap().id(),
        session.local_stream().id()
    );
}
