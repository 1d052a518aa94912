mod common;

use common::{s16, scripted, settle, test_config};
use std::time::Duration;
use voxlink::protocol::SampleFormat;
use voxlink::{
    BreakerState, ConnectionState, OutputFormat, Outbound, SynthError, SynthesisManager,
    SynthesisOptions,
};

#[tokio::test(start_paused = true)]
async fn single_request_is_reassembled_in_order() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .submit("Hello world.", SynthesisOptions::default().voice("bf_emma"))
                .await
        })
    };

    let mut peer = feed.next().await;
    let request = peer.expect_request().await;
    assert_eq!(request.text, "Hello world.");
    assert_eq!(request.voice, "bf_emma");
    assert_eq!(request.format, "pcm");

    let first = s16(&[1, 2, 3]);
    let second = s16(&[4, 5]);
    let third = s16(&[6]);
    peer.respond_s16(&[&first, &second, &third]);

    let audio = task.await.unwrap().unwrap();
    assert_eq!(audio.bytes, s16(&[1, 2, 3, 4, 5, 6]));
    assert_eq!(audio.format, OutputFormat::Pcm);
    assert_eq!(audio.sample_rate, 24_000);
    assert_eq!(audio.stats.segments, 1);
    assert!(audio.stats.time_to_first_audio.is_some());
    assert_eq!(connector.connects(), 1);

    let metrics = manager.metrics();
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.audio_bytes_received, 12);
}

#[tokio::test(start_paused = true)]
async fn one_request_in_flight_and_fifo_resolution() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);
    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut tasks = Vec::new();
    for (label, format) in [
        ("one", OutputFormat::Wav),
        ("two", OutputFormat::Pcm),
        ("three", OutputFormat::Pcm),
    ] {
        let manager = manager.clone();
        let order_tx = order_tx.clone();
        tasks.push(tokio::spawn(async move {
            let result = manager
                .submit(label, SynthesisOptions::default().format(format))
                .await;
            let _ = order_tx.send(label);
            result
        }));
        settle().await;
    }

    let mut peer = feed.next().await;
    for (i, label) in ["one", "two", "three"].iter().enumerate() {
        let request = peer.expect_request().await;
        assert_eq!(&request.text, label);

        settle().await;
        assert!(
            !peer.has_pending_request(),
            "a second request was sent while '{}' was in flight",
            label
        );

        let marker = s16(&[i as i16 * 100]);
        peer.respond_s16(&[&marker]);
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    assert_eq!(results[0].format, OutputFormat::Wav);
    assert!(results[0].bytes.ends_with(&s16(&[0])));
    assert_eq!(results[1].bytes, s16(&[100]));
    assert_eq!(results[2].bytes, s16(&[200]));

    let order: Vec<&str> = [
        order_rx.recv().await.unwrap(),
        order_rx.recv().await.unwrap(),
        order_rx.recv().await.unwrap(),
    ]
    .to_vec();
    assert_eq!(order, vec!["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn peer_error_rejects_only_that_request() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let failing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("bad voice", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    peer.expect_request().await;
    peer.done_with_error("voice 'zz_none' not found");

    assert_eq!(
        failing.await.unwrap(),
        Err(SynthError::Synthesis("voice 'zz_none' not found".to_string()))
    );

    let ok = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("fine", SynthesisOptions::default()).await })
    };
    peer.expect_request().await;
    peer.respond_s16(&[&s16(&[7])]);

    assert!(ok.await.unwrap().is_ok());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_text_surfaces_peer_message() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    let request = peer.expect_request().await;
    assert_eq!(request.text, "");
    peer.done_with_error("empty text");

    assert_eq!(
        task.await.unwrap(),
        Err(SynthError::Synthesis("empty text".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_then_recovers_through_one_trial() {
    let (connector, mut feed) = scripted();
    let mut config = test_config();
    config.breaker.failure_threshold = 2;
    config.breaker.reset_timeout = Duration::from_secs(10);
    let manager = SynthesisManager::new(config, connector.clone());

    connector.refuse(true);
    for _ in 0..2 {
        let result = manager.submit("x", SynthesisOptions::default()).await;
        assert!(matches!(result, Err(SynthError::Connection(_))));
    }
    assert_eq!(connector.connects(), 2);

    // Open: fails fast without touching the transport
    let result = manager.submit("x", SynthesisOptions::default()).await;
    assert_eq!(result, Err(SynthError::BreakerOpen));
    assert_eq!(connector.connects(), 2);
    assert_eq!(manager.status().await.unwrap().breaker, BreakerState::Open);

    tokio::time::sleep(Duration::from_secs(10)).await;
    connector.refuse(false);

    let trial = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("trial", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    peer.expect_request().await;
    peer.respond_s16(&[&s16(&[1])]);

    assert!(trial.await.unwrap().is_ok());
    assert_eq!(manager.status().await.unwrap().breaker, BreakerState::Closed);
    assert_eq!(manager.metrics().breaker_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_keeps_connection_and_drains_late_frames() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("slow", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    assert_eq!(peer.expect_request().await.text, "slow");

    assert_eq!(
        slow.await.unwrap(),
        Err(SynthError::Timeout(Duration::from_secs(5)))
    );

    let next = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("next", SynthesisOptions::default()).await })
    };
    settle().await;
    // Held back until the abandoned request finishes on the wire
    assert!(!peer.has_pending_request());
    assert!(manager.status().await.unwrap().draining);

    peer.respond_s16(&[&s16(&[-1, -1, -1])]);
    assert_eq!(peer.expect_request().await.text, "next");
    peer.respond_s16(&[&s16(&[42])]);

    let audio = next.await.unwrap().unwrap();
    assert_eq!(audio.bytes, s16(&[42]));
    assert_eq!(connector.connects(), 1);

    let metrics = manager.metrics();
    assert_eq!(metrics.timed_out, 1);
    assert_eq!(metrics.drained_frames, 3);
}

#[tokio::test(start_paused = true)]
async fn disconnect_rejects_active_and_reconnects_for_queue() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("first", SynthesisOptions::default()).await })
    };
    settle().await;
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("second", SynthesisOptions::default()).await })
    };

    let mut peer = feed.next().await;
    assert_eq!(peer.expect_request().await.text, "first");
    settle().await;
    peer.disconnect("connection reset");

    // Abandoned, not resent
    assert!(matches!(
        first.await.unwrap(),
        Err(SynthError::Connection(_))
    ));

    let mut peer = feed.next().await;
    assert_eq!(peer.expect_request().await.text, "second");
    peer.respond_s16(&[&s16(&[9])]);

    assert!(second.await.unwrap().is_ok());
    assert_eq!(connector.connects(), 2);
    assert_eq!(manager.metrics().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_rejects_everything_outstanding() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let mut tasks = Vec::new();
    for text in ["a", "b", "c"] {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.submit(text, SynthesisOptions::default()).await
        }));
        settle().await;
    }

    let mut peer = feed.next().await;
    peer.expect_request().await;
    connector.refuse(true);
    peer.disconnect("server restarted");

    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(SynthError::Connection(_))));
    }
    assert_eq!(connector.connects(), 2);

    let status = manager.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert_eq!(status.queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_disconnect_reconnects_lazily() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    manager.ensure_open().await.unwrap();
    let peer = feed.next().await;
    peer.disconnect("idle timeout");
    settle().await;

    assert_eq!(
        manager.status().await.unwrap().connection,
        ConnectionState::Disconnected
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.connects(), 1);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("again", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    peer.expect_request().await;
    peer.respond_s16(&[&s16(&[3])]);
    assert!(task.await.unwrap().is_ok());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_ensure_open_shares_one_connect() {
    let (connector, _feed) = scripted();
    connector.set_delay(Duration::from_millis(200));
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let results = futures_util::future::join_all((0..5).map(|_| manager.ensure_open())).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(connector.connects(), 1);
    assert_eq!(
        manager.status().await.unwrap().connection,
        ConnectionState::Open
    );
}

#[tokio::test(start_paused = true)]
async fn initial_connect_gives_up_after_configured_attempts() {
    let (connector, _feed) = scripted();
    connector.refuse(true);
    let mut config = test_config();
    config.retry.max_attempts = 3;
    let manager = SynthesisManager::new(config, connector.clone());

    let result = manager.ensure_open().await;
    assert!(matches!(result, Err(SynthError::Connection(_))));
    assert_eq!(connector.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn keepalive_probes_only_while_open() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);

    manager.ensure_open().await.unwrap();
    let mut peer = feed.next().await;

    tokio::time::sleep(Duration::from_secs(95)).await;
    let mut pings = 0;
    while let Some(outbound) = peer.try_outbound() {
        assert_eq!(outbound, Outbound::Ping);
        pings += 1;
    }
    assert_eq!(pings, 3);

    manager.close().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(peer.next_outbound().await, Some(Outbound::Close));
    assert_eq!(peer.next_outbound().await, None);
    assert_eq!(manager.metrics().probes_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn close_rejects_active_and_queued() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector.clone());

    let mut tasks = Vec::new();
    for text in ["active", "queued"] {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.submit(text, SynthesisOptions::default()).await
        }));
        settle().await;
    }
    let mut peer = feed.next().await;
    peer.expect_request().await;

    manager.close().await;
    for task in tasks {
        assert_eq!(task.await.unwrap(), Err(SynthError::Closed));
    }

    // Late frames from the old connection change nothing
    peer.respond_s16(&[&s16(&[1])]);
    settle().await;

    assert_eq!(
        manager.submit("after", SynthesisOptions::default()).await,
        Err(SynthError::Closed)
    );
    assert_eq!(manager.ensure_open().await, Err(SynthError::Closed));
    assert!(manager.status().await.unwrap().closed);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn stray_frames_are_counted_and_ignored() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);

    manager.ensure_open().await.unwrap();
    let mut peer = feed.next().await;

    peer.audio(&s16(&[5, 5]));
    peer.done();
    peer.malformed("unrecognized control frame");
    settle().await;
    assert_eq!(manager.metrics().protocol_errors, 3);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("clean", SynthesisOptions::default()).await })
    };
    peer.expect_request().await;
    peer.meta(24_000, SampleFormat::S16);
    peer.audio(&s16(&[8]));
    // Repeated meta is ignored, the audio keeps its original format
    peer.meta(16_000, SampleFormat::F32);
    peer.done();

    let audio = task.await.unwrap().unwrap();
    assert_eq!(audio.bytes, s16(&[8]));
    assert_eq!(audio.sample_rate, 24_000);
    assert_eq!(manager.metrics().protocol_errors, 4);
}

#[tokio::test(start_paused = true)]
async fn mulaw_output_from_float_source() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .submit("phone", SynthesisOptions::default().format(OutputFormat::Mulaw))
                .await
        })
    };
    let mut peer = feed.next().await;
    assert_eq!(peer.expect_request().await.format, "mulaw");

    let silence: Vec<u8> = std::iter::repeat(0.0f32.to_le_bytes())
        .take(2_400)
        .flatten()
        .collect();
    peer.meta(24_000, SampleFormat::F32);
    peer.audio(&silence[..4_800]);
    peer.audio(&silence[4_800..]);
    peer.done();

    let audio = task.await.unwrap().unwrap();
    assert_eq!(audio.format, OutputFormat::Mulaw);
    assert_eq!(audio.sample_rate, 8_000);
    assert_eq!(audio.bytes.len(), 800);
    assert!(audio.bytes.iter().all(|&b| b == 0xFF));
}

#[tokio::test(start_paused = true)]
async fn missing_meta_uses_fallback_rate() {
    let (connector, mut feed) = scripted();
    let mut config = test_config();
    config.fallback_sample_rate = 22_050;
    let manager = SynthesisManager::new(config, connector);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("no meta", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    peer.expect_request().await;
    peer.audio(&s16(&[1, 2]));
    peer.done();

    let audio = task.await.unwrap().unwrap();
    assert_eq!(audio.sample_rate, 22_050);
    assert_eq!(audio.bytes, s16(&[1, 2]));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_closes_the_connection() {
    let (connector, mut feed) = scripted();
    let manager = SynthesisManager::new(test_config(), connector);
    let other = manager.clone();

    manager.ensure_open().await.unwrap();
    let mut peer = feed.next().await;

    drop(manager);
    settle().await;
    // Another handle is still alive
    assert!(peer.try_outbound().is_none());

    drop(other);
    assert_eq!(peer.next_outbound().await, Some(Outbound::Close));
}

#[tokio::test(start_paused = true)]
async fn request_held_behind_a_drain_gets_its_full_timeout() {
    let (connector, mut feed) = scripted();
    let mut config = test_config();
    config.breaker.failure_threshold = 2;
    let manager = SynthesisManager::new(config, connector.clone());

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("slow", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    assert_eq!(peer.expect_request().await.text, "slow");
    assert_eq!(
        slow.await.unwrap(),
        Err(SynthError::Timeout(Duration::from_secs(5)))
    );

    let next = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("next", SynthesisOptions::default()).await })
    };
    settle().await;

    // The abandoned request takes most of another timeout to finish
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!peer.has_pending_request());
    peer.respond_s16(&[&s16(&[-1])]);
    assert_eq!(peer.expect_request().await.text, "next");

    // Past the moment "next" was queued plus the timeout, but within its own budget
    tokio::time::sleep(Duration::from_secs(3)).await;
    peer.respond_s16(&[&s16(&[42])]);

    assert_eq!(next.await.unwrap().unwrap().bytes, s16(&[42]));
    assert_eq!(manager.status().await.unwrap().breaker, BreakerState::Closed);
    assert_eq!(manager.metrics().timed_out, 1);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_drain_recycles_the_connection() {
    let (connector, mut feed) = scripted();
    let mut config = test_config();
    config.breaker.failure_threshold = 2;
    let manager = SynthesisManager::new(config, connector.clone());

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("slow", SynthesisOptions::default()).await })
    };
    let mut peer = feed.next().await;
    peer.expect_request().await;
    assert!(matches!(slow.await.unwrap(), Err(SynthError::Timeout(_))));

    let next = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("next", SynthesisOptions::default()).await })
    };

    // The peer never finishes "slow"; a fresh connection takes over
    let mut fresh = feed.next().await;
    assert_eq!(peer.next_outbound().await, Some(Outbound::Close));
    assert_eq!(fresh.expect_request().await.text, "next");
    fresh.respond_s16(&[&s16(&[5])]);

    assert_eq!(next.await.unwrap().unwrap().bytes, s16(&[5]));
    assert_eq!(connector.connects(), 2);

    let status = manager.status().await.unwrap();
    assert_eq!(status.breaker, BreakerState::Closed);
    assert_eq!(status.connection, ConnectionState::Open);
    assert!(!status.draining);

    let third = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit("third", SynthesisOptions::default()).await })
    };
    assert_eq!(fresh.expect_request().await.text, "third");
    fresh.respond_s16(&[&s16(&[6])]);
    assert!(third.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn five_peer_failures_open_the_breaker_without_sending() {
    let (connector, mut feed) = scripted();
    let config = test_config();
    assert_eq!(config.breaker.failure_threshold, 5);
    let manager = SynthesisManager::new(config, connector.clone());

    manager.ensure_open().await.unwrap();
    let mut peer = feed.next().await;

    for i in 0..5 {
        let text = format!("attempt {}", i);
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.submit(text, SynthesisOptions::default()).await })
        };
        peer.expect_request().await;
        peer.done_with_error("synthesis backend crashed");
        assert!(matches!(task.await.unwrap(), Err(SynthError::Synthesis(_))));
    }

    let result = manager.submit("sixth", SynthesisOptions::default()).await;
    assert_eq!(result, Err(SynthError::BreakerOpen));

    settle().await;
    assert!(!peer.has_pending_request());
    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.status().await.unwrap().breaker, BreakerState::Open);
}
