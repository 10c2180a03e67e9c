//! Property-based tests for the wire codecs.

use proptest::prelude::*;

use vantun_core::fec::Fec;
use vantun_core::obfs::Http3Obfuscator;
use vantun_core::varint::{read_varint, varint_len, write_varint, MAX_VARINT};

proptest! {
    #[test]
    fn varint_round_trips_minimally(value in 0u64..=MAX_VARINT) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value).unwrap();
        prop_assert_eq!(buf.len(), varint_len(value));

        // Shortest legal form: the next smaller form cannot hold the value.
        match buf.len() {
            1 => {}
            2 => prop_assert!(value > 0x3f),
            4 => prop_assert!(value > 0x3fff),
            8 => prop_assert!(value > 0x3fff_ffff),
            other => prop_assert!(false, "unexpected length {}", other),
        }

        let mut slice = &buf[..];
        prop_assert_eq!(read_varint(&mut slice).unwrap(), value);
        prop_assert!(slice.is_empty());
    }

    #[test]
    fn varint_truncations_always_fail(value in 0x40u64..=MAX_VARINT) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value).unwrap();
        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            prop_assert!(read_varint(&mut slice).is_err());
        }
    }

    #[test]
    fn obfuscator_round_trips_arbitrary_payloads(
        data in prop::collection::vec(any::<u8>(), 0..8192),
        min_padding in 0usize..64,
        extra_padding in 0usize..128,
        seed in any::<u64>(),
    ) {
        let mut obfs = Http3Obfuscator::seeded(
            vec![0x00, 0x01],
            min_padding,
            min_padding + extra_padding,
            seed,
        );
        let encoded = obfs.encode(&data).unwrap();
        if !data.is_empty() {
            prop_assert!(encoded.len() > data.len());
        }
        prop_assert_eq!(obfs.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn fec_recovers_from_any_viable_loss_pattern(
        data in prop::collection::vec(any::<u8>(), 1..2048),
        lost in prop::collection::hash_set(0usize..7, 0..=3),
    ) {
        let fec = Fec::new(4, 3).unwrap();
        let shards = fec.encode(&data).unwrap();
        let mut slots: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for &index in &lost {
            slots[index] = None;
        }

        let decoded = fec.decode(slots).unwrap();
        prop_assert_eq!(&decoded[..data.len()], &data[..]);
        prop_assert!(decoded[data.len()..].iter().all(|&b| b == 0));
    }
}
