//! Property-based tests using proptest
//!
//! These tests check the codec and batching invariants across randomly
//! generated payloads and chunkings.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use blitnet::core::batcher::{Batcher, FRAME_HEADER_SIZE};
use blitnet::core::reader::NetworkReader;
use blitnet::core::unbatcher::Unbatcher;
use blitnet::core::writer::NetworkWriter;
use blitnet::error::ProtocolError;
use blitnet::utils::buffer_pool::WriterPool;
use proptest::prelude::*;

// Property: Primitives read back exactly as written, in order
proptest! {
    #[test]
    fn prop_primitive_roundtrip(a in any::<u8>(), b in any::<i16>(), c in any::<u32>(), d in any::<i64>(), e in any::<bool>()) {
        let mut writer = NetworkWriter::new();
        writer.write(a);
        writer.write(b);
        writer.write(c);
        writer.write(d);
        writer.write(e);
        prop_assert_eq!(writer.position(), 1 + 2 + 4 + 8 + 1);

        let mut reader = NetworkReader::new(writer.to_bytes());
        prop_assert_eq!(reader.read::<u8>().unwrap(), a);
        prop_assert_eq!(reader.read::<i16>().unwrap(), b);
        prop_assert_eq!(reader.read::<u32>().unwrap(), c);
        prop_assert_eq!(reader.read::<i64>().unwrap(), d);
        prop_assert_eq!(reader.read::<bool>().unwrap(), e);
        prop_assert_eq!(reader.remaining(), 0);
    }
}

// Property: Integers are always little-endian on the wire
proptest! {
    #[test]
    fn prop_integers_little_endian(value in any::<u32>()) {
        let mut writer = NetworkWriter::new();
        writer.write(value);
        prop_assert_eq!(writer.as_slice(), &value.to_le_bytes()[..]);
    }
}

// Property: Strings survive the length-prefixed encoding, including absent ones
proptest! {
    #[test]
    fn prop_string_roundtrip(text in proptest::option::of(".{0,64}")) {
        let mut writer = NetworkWriter::new();
        writer.write_string(text.as_deref()).unwrap();

        let mut reader = NetworkReader::new(writer.to_bytes());
        prop_assert_eq!(reader.read_string().unwrap(), text);
        prop_assert_eq!(reader.remaining(), 0);
    }
}

// Property: Reading past the end fails and never panics
proptest! {
    #[test]
    fn prop_truncated_reads_fail(data in prop::collection::vec(any::<u8>(), 0..8)) {
        let mut reader = NetworkReader::from_slice(&data);
        let result = reader.read::<u64>();
        prop_assert!(matches!(result, Err(ProtocolError::EndOfData { .. })), "expected EndOfData, got {:?}", result);
    }
}

// Property: Arbitrary bytes never make string decoding panic
proptest! {
    #[test]
    fn prop_garbage_string_decoding_is_safe(data in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut reader = NetworkReader::from_slice(&data);
        let _ = reader.read_string();
    }
}

// Property: Any chunking of the batched stream yields the original frames in order
proptest! {
    #[test]
    fn prop_batch_unbatch_identity(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..60), 1..40),
        chunk_size in 1usize..97,
    ) {
        let mut batcher = Batcher::new(128, WriterPool::default());
        for payload in &payloads {
            batcher.enqueue(payload).unwrap();
        }

        let mut stream = Vec::new();
        while let Some(batch) = batcher.try_dequeue() {
            prop_assert!(batch.position() <= 128);
            stream.extend_from_slice(batch.as_slice());
        }

        let mut unbatcher = Unbatcher::new(128);
        let mut frames = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            unbatcher.enqueue(chunk);
            while let Some(frame) = unbatcher.try_dequeue().unwrap() {
                frames.push(frame.to_vec());
            }
        }

        prop_assert_eq!(frames, payloads);
        prop_assert_eq!(unbatcher.backlog_len(), 0);
    }
}

// Property: A payload that cannot fit an empty batch is rejected and leaves the batcher untouched
proptest! {
    #[test]
    fn prop_oversized_payload_rejected(threshold in 8usize..256, extra in 1usize..64) {
        let mut batcher = Batcher::new(threshold, WriterPool::default());
        let payload = vec![0u8; threshold - FRAME_HEADER_SIZE + extra];

        let result = batcher.enqueue(&payload);
        let is_oversized = matches!(result, Err(ProtocolError::OversizedPayload { .. }));
        prop_assert!(is_oversized);
        prop_assert!(batcher.is_empty());
    }
}
