//! Capture worker: batched receive, pipeline, batched inject.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::debug;

use super::{EngineShared, lock};
use crate::divert::{DivertAddress, DivertHandle, RecvError};
use crate::observe::ObservationRecord;
use crate::packet::CapturedPacket;
use crate::parse;

pub(crate) fn capture_worker(shared: Arc<EngineShared>, worker_id: u32) {
    let params = lock(&shared.params).clone();
    let mut recv_buf = vec![0u8; params.recv_buffer_bytes as usize];
    let mut addrs = vec![DivertAddress::default(); params.batch_size as usize];

    debug!(worker_id, "capture worker started");

    while !shared.stop.load(Ordering::Relaxed) {
        let Some(handle) = shared.current_handle() else {
            break;
        };

        let (recv_len, count) = match handle.recv_batch(&mut recv_buf, &mut addrs) {
            Ok(result) => result,
            Err(RecvError::NoData) => break,
            Err(RecvError::Driver(message)) => {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                shared.set_error(format!("batched receive failed: {message}"));
                continue;
            }
        };
        if count == 0 {
            continue;
        }

        shared.stats.batches.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .total_batch_packets
            .fetch_add(count as u64, Ordering::Relaxed);

        let batch = split_batch(
            &shared,
            &recv_buf[..recv_len],
            &addrs[..count],
            params.max_packet_size as usize,
        );
        let out = run_pipeline(&shared, batch);
        inject_batch(&shared, handle.as_ref(), out);
    }

    debug!(worker_id, "capture worker stopped");
}

/// Split the contiguous receive buffer into owned packets using the length
/// field each IP header carries, mirroring every packet into the observation
/// ring along the way.
fn split_batch(
    shared: &EngineShared,
    buf: &[u8],
    addrs: &[DivertAddress],
    max_packet_size: usize,
) -> Vec<CapturedPacket> {
    let captured_at = Instant::now();
    let mut packets = Vec::with_capacity(addrs.len());
    let mut offset = 0usize;

    for addr in addrs {
        let remaining = &buf[offset..];
        let Some(parsed) = parse::parse_packet(remaining) else {
            // The split offset cannot advance past an unparseable header;
            // whatever follows in the buffer is unrecoverable.
            shared.set_error(format!(
                "unparseable packet at batch offset {offset}; skipping rest of buffer"
            ));
            break;
        };
        let wire_len = parsed.total_len;
        if wire_len > remaining.len() || wire_len > max_packet_size {
            shared.set_error(format!(
                "packet length {wire_len} exceeds {} remaining bytes (max {max_packet_size})",
                remaining.len()
            ));
            break;
        }

        if shared
            .observations
            .push(ObservationRecord::from_parsed(&parsed, addr, captured_at))
        {
            shared
                .stats
                .packets_dropped_observation
                .fetch_add(1, Ordering::Relaxed);
        }

        packets.push(CapturedPacket {
            data: remaining[..wire_len].to_vec(),
            addr: *addr,
            captured_at,
        });
        shared.stats.packets_captured.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .bytes_captured
            .fetch_add(wire_len as u64, Ordering::Relaxed);

        offset += wire_len;
    }

    packets
}

fn run_pipeline(shared: &EngineShared, mut batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
    for stage in shared.pipeline() {
        batch = stage.process_batch(batch);
    }
    batch
}

/// Concatenate a batch into one contiguous send buffer with its parallel
/// address array and hand it to the driver in a single call. Failed injects
/// are not retried; the packets are gone and the error is recorded.
pub(crate) fn inject_batch(
    shared: &EngineShared,
    handle: &dyn DivertHandle,
    batch: Vec<CapturedPacket>,
) {
    if batch.is_empty() {
        return;
    }

    let total_bytes: usize = batch.iter().map(CapturedPacket::len).sum();
    let mut send_buf = Vec::with_capacity(total_bytes);
    let mut send_addrs: SmallVec<DivertAddress, 32> = SmallVec::with_capacity(batch.len());
    for packet in &batch {
        send_buf.extend_from_slice(&packet.data);
        send_addrs.push(packet.addr);
    }

    match handle.send_batch(&send_buf, &send_addrs) {
        Ok(_) => {
            shared
                .stats
                .packets_injected
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(err) => shared.set_error(format!("batched inject failed: {err:#}")),
    }
}
