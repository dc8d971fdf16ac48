//! End-to-end dispatcher tests against the scriptable mock diverter.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::divert::DivertParam;
    use crate::engine::CaptureEngine;
    use crate::params::CaptureParams;
    use crate::test_helpers::{MockDiverter, inbound_addr, outbound_addr, udp_packet};
    use crate::tests::init_tracing;

    fn engine_with_mock() -> (Arc<MockDiverter>, CaptureEngine) {
        init_tracing();
        let mock = Arc::new(MockDiverter::new());
        let engine = CaptureEngine::new(mock.clone());
        (mock, engine)
    }

    fn sample_batch(n: usize) -> Vec<(Vec<u8>, crate::divert::DivertAddress)> {
        (0..n)
            .map(|i| {
                (
                    udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 4000 + i as u16, 53, 32),
                    outbound_addr(),
                )
            })
            .collect()
    }

    /// Give the capture worker time to pull and process pending batches.
    fn settle() {
        thread::sleep(Duration::from_millis(120));
    }

    #[test]
    fn test_start_twice_fails() {
        let (_mock, engine) = engine_with_mock();
        engine.start("true", CaptureParams::default()).unwrap();
        let err = engine.start("true", CaptureParams::default()).unwrap_err();
        assert!(err.to_string().contains("already capturing"));
        engine.stop();
    }

    #[test]
    fn test_start_rejects_invalid_params() {
        let (mock, engine) = engine_with_mock();
        let params = CaptureParams {
            worker_threads: 0,
            ..CaptureParams::default()
        };
        assert!(engine.start("true", params).is_err());
        assert!(!engine.is_running());
        assert_eq!(mock.open_count(), 0);
    }

    #[test]
    fn test_open_failure_surfaces_reason() {
        let (mock, engine) = engine_with_mock();
        mock.set_fail_open(true);
        let err = engine.start("true", CaptureParams::default()).unwrap_err();
        assert!(format!("{err:#}").contains("permission denied"));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_param_rejection_closes_handle() {
        let (mock, engine) = engine_with_mock();
        mock.set_reject_params(true);
        let err = engine.start("true", CaptureParams::default()).unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(!engine.is_running());
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_identity_passthrough() {
        let (mock, engine) = engine_with_mock();
        let batch = sample_batch(3);
        mock.push_batch(batch.clone());

        engine.start("true", CaptureParams::default()).unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.driver_version().major, 2);
        settle();

        let injected = mock.injected();
        assert_eq!(injected.len(), 3);
        for (i, (data, addr)) in injected.iter().enumerate() {
            assert_eq!(*data, batch[i].0, "payload {i} altered in flight");
            assert_eq!(*addr, batch[i].1, "metadata {i} altered in flight");
        }

        let stats = engine.stats();
        assert_eq!(stats.packets_captured, 3);
        assert_eq!(stats.packets_injected, 3);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.avg_batch_size, 3.0);
        assert_eq!(
            stats.bytes_captured,
            batch.iter().map(|(d, _)| d.len() as u64).sum::<u64>()
        );

        let observations = engine.take_observations();
        assert_eq!(observations.len(), 3);
        assert_eq!(observations[0].dst_port, 53);
        assert_eq!(observations[0].src_port, 4000);
        assert!(observations[0].outbound);

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.driver_version().major, 0);
    }

    #[test]
    fn test_full_loss_injects_nothing() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(5));

        engine.set_loss_enabled(true);
        engine.set_loss_rate(100.0);
        engine.start("udp", CaptureParams::default()).unwrap();
        settle();
        engine.stop();

        assert_eq!(mock.injected_count(), 0);
        let stats = engine.stats();
        assert_eq!(stats.packets_captured, 5);
        assert_eq!(stats.packets_injected, 0);
    }

    #[test]
    fn test_direction_gated_loss() {
        let (mock, engine) = engine_with_mock();
        let batch: Vec<_> = (0..10)
            .map(|i| {
                let addr = if i % 2 == 0 {
                    inbound_addr()
                } else {
                    outbound_addr()
                };
                (udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 9000, 53, 16), addr)
            })
            .collect();
        mock.push_batch(batch);

        engine.set_loss_enabled(true);
        engine.set_loss_rate(100.0);
        engine.set_loss_inbound(false);
        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        engine.stop();

        let injected = mock.injected();
        assert_eq!(injected.len(), 5);
        assert!(injected.iter().all(|(_, addr)| !addr.outbound));
    }

    #[test]
    fn test_latency_released_by_release_worker() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(2));

        engine.set_latency_enabled(true);
        engine.set_latency(150);
        engine.start("true", CaptureParams::default()).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(mock.injected_count(), 0, "released before the deadline");

        thread::sleep(Duration::from_millis(300));
        assert_eq!(mock.injected_count(), 2, "release worker never fired");

        engine.stop();
        let stats = engine.stats();
        assert_eq!(stats.packets_injected, 2);
    }

    #[test]
    fn test_stop_discards_delayed_packets() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(2));

        engine.set_latency_enabled(true);
        engine.set_latency(60_000);
        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        engine.stop();

        // The final drain empties the stage but the pipeline is over: the
        // held packets are discarded, not injected.
        assert_eq!(mock.injected_count(), 0);

        // A fresh session starts clean.
        engine.set_latency_enabled(false);
        mock.push_batch(sample_batch(1));
        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        engine.stop();
        assert_eq!(mock.injected_count(), 1);
    }

    #[test]
    fn test_enable_mid_capture_spawns_release_worker() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(2));
        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        assert_eq!(mock.injected_count(), 2);

        engine.set_latency(40);
        engine.set_latency_enabled(true);
        mock.push_batch(sample_batch(3));
        thread::sleep(Duration::from_millis(200));

        assert_eq!(mock.injected_count(), 5, "mid-capture release worker missing");
        engine.stop();
    }

    #[test]
    fn test_runtime_queue_knobs() {
        let (mock, engine) = engine_with_mock();
        assert!(!engine.set_queue_length(1000), "no handle before start");

        engine.start("true", CaptureParams::default()).unwrap();
        assert!(engine.set_queue_length(1000));
        assert!(engine.set_queue_time(500));
        assert!(engine.set_queue_bytes(131072));
        let params = engine.params();
        assert_eq!(params.queue_length, 1000);
        assert_eq!(params.queue_time_ms, 500);
        assert_eq!(params.queue_bytes, 131072);
        assert!(
            mock.params_set()
                .contains(&(DivertParam::QueueLength, 1000))
        );

        mock.set_reject_params(true);
        assert!(!engine.set_queue_time(900));
        assert_eq!(engine.params().queue_time_ms, 500, "cache updated on reject");
        engine.stop();
    }

    #[test]
    fn test_observation_ring_overflow() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(3));

        let mut params = CaptureParams::default();
        params.ring_capacity = 2;
        engine.start("true", params).unwrap();
        settle();
        engine.stop();

        let observations = engine.take_observations();
        assert_eq!(observations.len(), 2);
        // The survivors are the two most recent captures.
        assert_eq!(observations[0].src_port, 4001);
        assert_eq!(observations[1].src_port, 4002);
        assert_eq!(engine.stats().packets_dropped_observation, 1);
    }

    #[test]
    fn test_send_failure_records_last_error() {
        let (mock, engine) = engine_with_mock();
        mock.set_fail_send(true);
        mock.push_batch(sample_batch(2));

        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        engine.stop();

        assert_eq!(mock.injected_count(), 0);
        let error = engine.last_error().expect("inject failure not recorded");
        assert!(error.contains("inject"));
        assert_eq!(engine.stats().packets_injected, 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let (mock, engine) = engine_with_mock();
        engine.start("true", CaptureParams::default()).unwrap();
        engine.stop();
        engine.start("tcp", CaptureParams::default()).unwrap();
        engine.stop();
        assert_eq!(mock.open_count(), 2);
        assert_eq!(mock.close_count(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_mock, engine) = engine_with_mock();
        engine.stop();
        engine.start("true", CaptureParams::default()).unwrap();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_multiple_capture_workers() {
        let (mock, engine) = engine_with_mock();
        for _ in 0..4 {
            mock.push_batch(sample_batch(2));
        }

        let mut params = CaptureParams::default();
        params.worker_threads = 2;
        engine.start("true", params).unwrap();
        settle();
        engine.stop();

        assert_eq!(mock.injected_count(), 8);
        let stats = engine.stats();
        assert_eq!(stats.packets_captured, 8);
        assert_eq!(stats.batches, 4);
        assert_eq!(stats.avg_batch_size, 2.0);
    }

    #[test]
    fn test_stats_monotonic_across_session() {
        let (mock, engine) = engine_with_mock();
        mock.push_batch(sample_batch(2));
        engine.start("true", CaptureParams::default()).unwrap();
        settle();
        let first = engine.stats();

        mock.push_batch(sample_batch(2));
        settle();
        let second = engine.stats();
        engine.stop();

        assert!(second.packets_captured >= first.packets_captured);
        assert!(second.packets_injected >= first.packets_injected);
        assert!(second.bytes_captured >= first.bytes_captured);
        assert!(second.batches >= first.batches);
        assert_eq!(second.packets_captured, 4);
    }
}
