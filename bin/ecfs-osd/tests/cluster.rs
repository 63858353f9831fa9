//! End-to-end protocol tests over a loopback cluster

mod common;

use bytes::Bytes;
use common::{Cluster, random_segment, send_chunks, upload, upload_request};
use ecfs_common::{BlockKey, CodingScheme, Error, NodeId, SegmentId, Symbol};
use ecfs_osd::SegmentReply;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn seg(id: u64) -> SegmentId {
    SegmentId::new(id)
}

fn node(id: u32) -> NodeId {
    NodeId::new(id)
}

async fn download(cluster: &Cluster, on: u32, segment_id: SegmentId) -> Bytes {
    cluster
        .node(on)
        .get_segment(segment_id, false)
        .await
        .unwrap()
        .into_data()
        .unwrap()
}

#[tokio::test]
async fn test_upload_download_every_scheme() {
    let cases = [
        (CodingScheme::Replication, "3"),
        (CodingScheme::Striping, "3"),
        (CodingScheme::Raid5, "3"),
        (CodingScheme::ReedSolomon, "2:1"),
        (CodingScheme::Rdp, "2"),
    ];
    let cluster = Cluster::new(4);

    for (i, (scheme, setting)) in cases.into_iter().enumerate() {
        let segment_id = seg(i as u64);
        let data = random_segment(10_000 + i);
        let info = upload(cluster.node(0), segment_id, &data, scheme, setting)
            .await
            .unwrap();

        assert_eq!(info.size, data.len() as u64);
        assert_eq!(cluster.net.segment(segment_id), Some(info.clone()));
        let stored: usize = info
            .node_list
            .iter()
            .enumerate()
            .filter(|&(block_id, &owner)| {
                cluster
                    .node(owner.as_u32())
                    .store()
                    .has_block(BlockKey::new(segment_id, block_id as u32))
            })
            .count();
        assert_eq!(stored, info.node_list.len(), "{scheme} blocks not placed");

        // The uploader keeps the segment cached; node 3 has to reconstruct
        assert!(cluster.node(0).store().is_cached(segment_id));
        assert_eq!(&download(&cluster, 3, segment_id).await[..], &data[..]);
        assert!(cluster.node(3).store().is_cached(segment_id));
    }

    let stats = cluster.node(3).stats().snapshot();
    assert_eq!(stats.decodes, 5);
    assert_eq!(cluster.node(0).stats().snapshot().segments_uploaded, 5);
    assert_eq!(cluster.node(0).store().active_transfers(), 0);
}

#[tokio::test]
async fn test_empty_segment() {
    let cluster = Cluster::new(3);
    let info = upload(cluster.node(0), seg(1), b"", CodingScheme::ReedSolomon, "2:1")
        .await
        .unwrap();
    assert_eq!(info.size, 0);
    assert!(download(&cluster, 2, seg(1)).await.is_empty());
}

#[tokio::test]
async fn test_degraded_read() {
    let cluster = Cluster::new(4);
    let data = random_segment(50_000);
    upload(cluster.node(0), seg(7), &data, CodingScheme::ReedSolomon, "2:2")
        .await
        .unwrap();

    cluster.net.set_down(node(0));
    cluster.net.set_down(node(1));
    assert_eq!(&download(&cluster, 2, seg(7)).await[..], &data[..]);

    // Only the parity block on node 3 had to come over the network
    assert_eq!(cluster.net.get_block_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unrecoverable_segment() {
    let cluster = Cluster::new(4);
    let data = random_segment(5_000);
    upload(cluster.node(0), seg(8), &data, CodingScheme::ReedSolomon, "2:2")
        .await
        .unwrap();

    for id in [0, 1, 3] {
        cluster.net.set_down(node(id));
    }
    let err = cluster.node(2).get_segment(seg(8), false).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBlocks(id) if id == seg(8)));

    // The node keeps serving other requests
    cluster.node(2).store().put_to_disk_cache(seg(9), b"still fine").unwrap();
    assert_eq!(&download(&cluster, 2, seg(9)).await[..], b"still fine");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_downloads_coalesce() {
    let cluster = Cluster::with_latency(3, Duration::from_millis(5));
    let data = random_segment(40_000);
    upload(cluster.node(0), seg(3), &data, CodingScheme::ReedSolomon, "2:1")
        .await
        .unwrap();
    let calls_after_upload = cluster.net.get_block_calls.load(Ordering::SeqCst);

    let downloader = Arc::clone(cluster.node(1));
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let osd = Arc::clone(&downloader);
            tokio::spawn(async move { osd.get_segment(seg(3), false).await })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        let reply = task.unwrap().unwrap();
        assert_eq!(reply, SegmentReply::Data(Bytes::from(data.clone())));
    }

    let stats = downloader.stats().snapshot();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.coalesced_waits + stats.cache_hits, 7);
    // Block 1 is local to node 1, block 0 is fetched once
    assert_eq!(
        cluster.net.get_block_calls.load(Ordering::SeqCst) - calls_after_upload,
        1
    );
}

#[tokio::test]
async fn test_local_retrieve() {
    let cluster = Cluster::new(3);
    let data = random_segment(8_000);
    upload(cluster.node(0), seg(4), &data, CodingScheme::Raid5, "3")
        .await
        .unwrap();

    let reply = cluster.node(2).get_segment(seg(4), true).await.unwrap();
    assert_eq!(reply, SegmentReply::Cached);
    assert!(cluster.node(2).store().is_cached(seg(4)));

    // A second local retrieve and a normal read are both served from the cache
    assert_eq!(
        cluster.node(2).get_segment(seg(4), true).await.unwrap(),
        SegmentReply::Cached
    );
    assert_eq!(&download(&cluster, 2, seg(4)).await[..], &data[..]);
    assert_eq!(cluster.node(2).stats().snapshot().decodes, 1);
}

#[tokio::test]
async fn test_checksum_mismatch_rejects_upload() {
    let cluster = Cluster::new(3);
    let data = random_segment(3_000);
    let mut request = upload_request(&data, CodingScheme::Replication, "3");
    request.checksum = ecfs_common::content_hash(b"something else");

    let osd = cluster.node(0);
    osd.put_segment_init(seg(5), request).unwrap();
    send_chunks(osd, seg(5), &data);
    let err = osd.put_segment_end(seg(5)).await.unwrap_err();

    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert!(cluster.net.segment(seg(5)).is_none());
    assert_eq!(osd.store().active_transfers(), 0);
    assert!(!osd.store().is_cached(seg(5)));
    assert!(cluster.nodes.iter().all(|n| n.store().block_count() == 0));
    assert_eq!(osd.stats().snapshot().checksum_failures, 1);

    // The session is gone, so the upload cannot be finished twice
    assert!(matches!(
        osd.put_segment_end(seg(5)).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_setting_rejected_at_init() {
    let cluster = Cluster::new(3);
    let request = upload_request(b"abc", CodingScheme::Rdp, "3");
    assert!(matches!(
        cluster.node(0).put_segment_init(seg(6), request),
        Err(Error::Coding(_))
    ));
    assert_eq!(cluster.node(0).store().active_transfers(), 0);
}

#[tokio::test]
async fn test_repair_onto_spare_node() {
    let cluster = Cluster::new(4);
    cluster.net.set_placement(vec![node(0), node(1), node(2)]);
    let data = random_segment(30_000);
    upload(cluster.node(0), seg(10), &data, CodingScheme::ReedSolomon, "2:1")
        .await
        .unwrap();

    let key = BlockKey::new(seg(10), 1);
    let original = cluster.node(1).store().read_full_block(key).unwrap();
    cluster.net.set_down(node(1));

    cluster
        .node(2)
        .repair_segment(seg(10), vec![1], vec![node(3)])
        .await
        .unwrap();

    let repaired = cluster.node(3).store().read_full_block(key).unwrap();
    assert_eq!(&repaired[..], &original[..]);
    assert_eq!(cluster.net.repairs(), vec![(seg(10), vec![1], vec![node(3)])]);
    assert_eq!(cluster.net.segment(seg(10)).unwrap().node_list[1], node(3));
    assert_eq!(cluster.node(2).stats().snapshot().repairs, 1);

    // Read without the failed node, from one that holds nothing cached
    assert_eq!(&download(&cluster, 3, seg(10)).await[..], &data[..]);
}

#[tokio::test]
async fn test_rdp_repair_reads_less_than_full_blocks() {
    let cluster = Cluster::new(7);
    cluster
        .net
        .set_placement((0..6).map(node).collect());
    let data = random_segment(64_000);
    let info = upload(cluster.node(0), seg(11), &data, CodingScheme::Rdp, "4")
        .await
        .unwrap();
    let block_size = cluster
        .node(1)
        .store()
        .block_size(BlockKey::new(seg(11), 1))
        .unwrap();

    let key = BlockKey::new(seg(11), 0);
    let original = cluster.node(0).store().read_full_block(key).unwrap();
    cluster.net.set_down(node(0));

    cluster
        .node(6)
        .repair_segment(seg(11), vec![0], vec![node(6)])
        .await
        .unwrap();
    assert_eq!(
        &cluster.node(6).store().read_full_block(key).unwrap()[..],
        &original[..]
    );

    // Sub-block repair reads less than the k full blocks a decode would
    let read = cluster.net.recovery_bytes.load(Ordering::SeqCst) as u64;
    assert!(read < 4 * block_size, "read {read} bytes");
    assert!(cluster.net.recovery_calls.load(Ordering::SeqCst) <= info.node_list.len() - 1);
    assert_eq!(cluster.node(6).stats().snapshot().repairs, 1);
}

#[tokio::test]
async fn test_repair_with_too_many_failures() {
    let cluster = Cluster::new(3);
    upload(cluster.node(0), seg(12), &random_segment(2_000), CodingScheme::Raid5, "3")
        .await
        .unwrap();
    cluster.net.set_down(node(1));
    cluster.net.set_down(node(2));

    let err = cluster
        .node(0)
        .repair_segment(seg(12), vec![1, 2], vec![node(0), node(0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBlocks(_)));
    assert!(cluster.net.repairs().is_empty());

    assert!(matches!(
        cluster
            .node(0)
            .repair_segment(seg(12), vec![1], vec![])
            .await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_block_update_merge_and_delete() {
    let cluster = Cluster::new(1);
    let osd = cluster.node(0);
    let key = BlockKey::new(seg(20), 0);
    osd.store().store_block(key, b"hello world").unwrap();

    let first = osd.update_block(key, b"J", vec![Symbol::new(0, 1)]).unwrap();
    let second = osd.update_block(key, b"W", vec![Symbol::new(6, 1)]).unwrap();
    assert!(second > first);
    assert_eq!(osd.store().delta_count(key), 2);

    assert_eq!(osd.merge_block(key, false).unwrap(), 2);
    assert_eq!(&osd.store().read_full_block(key).unwrap()[..], b"Jello World");
    assert_eq!(osd.merge_block(key, false).unwrap(), 0);

    osd.delete_block(key).unwrap();
    assert!(!osd.store().has_block(key));
    assert!(matches!(
        osd.update_block(key, b"x", vec![Symbol::new(0, 1)]),
        Err(Error::BlockNotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_block_chunk_counted_once() {
    let cluster = Cluster::new(2);
    let osd = cluster.node(1);
    let key = BlockKey::new(seg(21), 0);

    osd.put_block_init(node(0), key, 8, 2).unwrap();
    assert_eq!(osd.put_block_data(key, 0, b"AAAA").unwrap(), 1);
    // A retried chunk is written again but leaves the count alone
    assert_eq!(osd.put_block_data(key, 0, b"AAAA").unwrap(), 1);
    assert_eq!(osd.store().session(key).unwrap().pending(), 1);
    assert_eq!(osd.put_block_data(key, 4, b"BBBB").unwrap(), 0);
    osd.put_block_end(key).await.unwrap();

    assert_eq!(&osd.store().read_full_block(key).unwrap()[..], b"AAAABBBB");
    assert_eq!(osd.store().active_transfers(), 0);
}

#[tokio::test]
async fn test_duplicate_segment_chunks_counted_once() {
    let cluster = Cluster::new(3);
    let osd = cluster.node(0);
    let data = random_segment(5_500);
    osd.put_segment_init(seg(22), upload_request(&data, CodingScheme::Raid5, "3"))
        .unwrap();

    // Resend the first chunk before the rest arrive
    assert_eq!(osd.put_segment_data(seg(22), 0, &data[..1000]).unwrap(), 5);
    assert_eq!(osd.put_segment_data(seg(22), 0, &data[..1000]).unwrap(), 5);
    send_chunks(osd, seg(22), &data);
    let info = osd.put_segment_end(seg(22)).await.unwrap();

    assert_eq!(info.size, data.len() as u64);
    assert_eq!(&download(&cluster, 2, seg(22)).await[..], &data[..]);
}

#[tokio::test]
async fn test_unreadable_cache_entry_falls_back_to_blocks() {
    let cluster = Cluster::new(3);
    let data = random_segment(12_000);
    upload(cluster.node(0), seg(23), &data, CodingScheme::ReedSolomon, "2:1")
        .await
        .unwrap();

    let osd = cluster.node(0);
    std::fs::remove_file(osd.store().layout().segment_path(seg(23))).unwrap();
    assert!(osd.store().is_cached(seg(23)));

    assert_eq!(&download(&cluster, 0, seg(23)).await[..], &data[..]);
    assert_eq!(osd.stats().snapshot().decodes, 1);
    // The rebuilt segment went back into the cache
    assert_eq!(&osd.store().get_from_disk_cache(seg(23)).unwrap()[..], &data[..]);
}
