use bytes::Bytes;
use proptest::prelude::*;
use taskweave::cluster::messages::{MessageIdAllocator, MessagePayload, TaskNewPayload};
use taskweave::cluster::{Message, SatisfiabilityInfo};
use taskweave::dependencies::{AccessSpec, AccessType};
use taskweave::errors::TaskweaveError;
use taskweave::region::Region;
use taskweave::types::WriteId;

fn task_new(label: String, words: Vec<u64>, regions: Vec<(u64, u64)>) -> Message {
    let accesses: Vec<_> = regions
        .iter()
        .map(|&(start, len)| AccessSpec::new(AccessType::ReadWrite, Region::new(start, len)))
        .collect();
    let infos = accesses
        .iter()
        .map(|access| SatisfiabilityInfo {
            region: access.region,
            location: Some(0),
            read: true,
            write: false,
            write_id: WriteId(7),
            namespace_predecessor: None,
        })
        .collect();
    let args: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    MessageIdAllocator::new().message(
        0,
        MessagePayload::TaskNew(TaskNewPayload {
            offloaded_id: 3,
            label,
            implementation: "increment".into(),
            accesses,
            infos,
            args: Bytes::from(args),
        }),
    )
}

fn task_new_strategy() -> impl Strategy<Value = Message> {
    (
        "[a-z]{0,12}",
        proptest::collection::vec(any::<u64>(), 0..4),
        proptest::collection::vec((0u64..1 << 40, 1u64..4096), 0..4),
    )
        .prop_map(|(label, words, regions)| task_new(label, words, regions))
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(raw in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Message::decode(Bytes::from(raw));
    }

    // A valid header in front of random payload bytes still fails cleanly.
    #[test]
    fn random_payloads_fail_cleanly(
        kind in 0u8..9,
        payload in proptest::collection::vec(any::<u8>(), 0..96),
    ) {
        let mut raw = vec![0x57, 0x54, kind];
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&payload);
        match Message::decode(Bytes::from(raw)) {
            Ok(msg) => prop_assert_eq!(msg.header.kind as u8, kind),
            Err(err) => prop_assert!(matches!(err, TaskweaveError::Codec(_)), "{err:?}"),
        }
    }

    #[test]
    fn every_truncation_is_a_codec_error(msg in task_new_strategy(), cut in any::<prop::sample::Index>()) {
        let encoded = msg.encode();
        let at = cut.index(encoded.len());
        let result = Message::decode(encoded.slice(..at));
        prop_assert!(matches!(result, Err(TaskweaveError::Codec(_))), "{result:?}");
    }

    #[test]
    fn task_new_survives_the_wire(msg in task_new_strategy()) {
        let decoded = Message::decode(msg.encode()).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}
