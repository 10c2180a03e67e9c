//! Reed-Solomon forward error correction.
//!
//! A codeword is k data shards plus m parity shards over GF(2^8). Input is
//! zero-padded to `k * shard_size` and partitioned row-major; any k of the
//! k+m shards reconstruct the codeword. Encoder matrices are expensive to
//! build, so instances are cached process-wide keyed by (k, m).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

type EncoderCache = RwLock<HashMap<(usize, usize), Arc<ReedSolomon>>>;

fn encoder_cache() -> &'static EncoderCache {
    static CACHE: OnceLock<EncoderCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn cached_encoder(k: usize, m: usize) -> Result<Arc<ReedSolomon>> {
    if let Some(enc) = encoder_cache().read().expect("encoder cache poisoned").get(&(k, m)) {
        return Ok(enc.clone());
    }
    let enc = Arc::new(
        ReedSolomon::new(k, m)
            .map_err(|e| Error::ConfigInvalid(format!("reed-solomon ({k},{m}): {e}")))?,
    );
    encoder_cache()
        .write()
        .expect("encoder cache poisoned")
        .insert((k, m), enc.clone());
    Ok(enc)
}

/// A (k, m) Reed-Solomon encoder/decoder.
pub struct Fec {
    rs: Arc<ReedSolomon>,
    k: usize,
    m: usize,
    // Size of the most recently encoded input; decode output stays padded to
    // k * shard_size, callers truncate with this when they hold the encoder.
    last_data_size: AtomicUsize,
}

impl Fec {
    /// Create a codec with `k` data shards and `m` parity shards.
    pub fn new(k: usize, m: usize) -> Result<Self> {
        if k == 0 || m == 0 {
            return Err(Error::ConfigInvalid(format!(
                "fec shard counts must be positive, got k={k} m={m}"
            )));
        }
        Ok(Self {
            rs: cached_encoder(k, m)?,
            k,
            m,
            last_data_size: AtomicUsize::new(0),
        })
    }

    /// Number of data shards.
    pub fn data_shards(&self) -> usize {
        self.k
    }

    /// Number of parity shards.
    pub fn parity_shards(&self) -> usize {
        self.m
    }

    /// Size of the last encoded input, 0 before the first encode.
    pub fn last_data_size(&self) -> usize {
        self.last_data_size.load(Ordering::Relaxed)
    }

    /// Encode `data` into k+m equal-length shards.
    ///
    /// Shard size is `ceil(len / k)`; the input is zero-padded to fill the
    /// data shards, and the trailing m shards carry parity.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::Codec("cannot fec-encode empty input".into()));
        }
        self.last_data_size.store(data.len(), Ordering::Relaxed);

        let shard_size = data.len().div_ceil(self.k);
        let mut shards = vec![vec![0u8; shard_size]; self.k + self.m];
        for (i, shard) in shards.iter_mut().take(self.k).enumerate() {
            let start = i * shard_size;
            if start < data.len() {
                let end = (start + shard_size).min(data.len());
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::Codec(format!("fec encode: {e}")))?;
        Ok(shards)
    }

    /// Reconstruct from k+m shard slots where `None` marks a lost shard.
    ///
    /// Returns the concatenated data shards: `k * shard_size` bytes,
    /// zero-padded past the original input length.
    pub fn decode(&self, mut shards: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>> {
        let total = self.k + self.m;
        if shards.len() != total {
            return Err(Error::Codec(format!(
                "invalid shard count: expected {total}, got {}",
                shards.len()
            )));
        }

        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < self.k {
            return Err(Error::FecUnrecoverable {
                present,
                total,
                needed: self.k,
            });
        }

        let shard_size = shards
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .expect("at least k shards present");
        if shards
            .iter()
            .flatten()
            .any(|s| s.len() != shard_size)
        {
            return Err(Error::Codec("shards have different sizes".into()));
        }

        self.rs.reconstruct(&mut shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => Error::FecUnrecoverable {
                present,
                total,
                needed: self.k,
            },
            other => Error::Codec(format!("fec reconstruct: {other}")),
        })?;

        let mut data = Vec::with_capacity(self.k * shard_size);
        for shard in shards.iter().take(self.k) {
            data.extend_from_slice(shard.as_deref().expect("reconstructed"));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"This is a test message for FEC encoding and decoding.";

    #[test]
    fn encode_shapes_shards() {
        let fec = Fec::new(10, 3).unwrap();
        let shards = fec.encode(SAMPLE).unwrap();
        assert_eq!(shards.len(), 13);
        assert!(shards.iter().all(|s| s.len() == 6));
        assert_eq!(fec.last_data_size(), 53);
    }

    #[test]
    fn decode_recovers_with_lost_shards() {
        let fec = Fec::new(10, 3).unwrap();
        let shards = fec.encode(SAMPLE).unwrap();

        let mut slots: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        slots[1] = None;
        slots[3] = None;

        let decoded = fec.decode(slots).unwrap();
        assert_eq!(decoded.len(), 60);
        assert_eq!(&decoded[..SAMPLE.len()], SAMPLE);
        assert!(decoded[SAMPLE.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn round_trip_with_external_truncation() {
        let fec = Fec::new(4, 2).unwrap();
        for len in [1usize, 5, 64, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let shards = fec.encode(&data).unwrap();
            let slots = shards.into_iter().map(Some).collect();
            let decoded = fec.decode(slots).unwrap();
            assert_eq!(&decoded[..fec.last_data_size()], &data[..]);
        }
    }

    #[test]
    fn recovers_from_any_k_shards() {
        let fec = Fec::new(10, 3).unwrap();
        let shards = fec.encode(SAMPLE).unwrap();

        // Exactly k shards left, parity and data losses mixed.
        let mut slots: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        slots[0] = None;
        slots[5] = None;
        slots[12] = None;

        let decoded = fec.decode(slots).unwrap();
        assert_eq!(&decoded[..SAMPLE.len()], SAMPLE);
    }

    #[test]
    fn too_many_losses_unrecoverable() {
        let fec = Fec::new(10, 3).unwrap();
        let shards = fec.encode(SAMPLE).unwrap();

        let mut slots: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for slot in slots.iter_mut().take(4) {
            *slot = None;
        }

        match fec.decode(slots) {
            Err(Error::FecUnrecoverable {
                present,
                total,
                needed,
            }) => {
                assert_eq!((present, total, needed), (9, 13, 10));
            }
            other => panic!("expected FecUnrecoverable, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        let fec = Fec::new(4, 2).unwrap();
        assert!(fec.encode(&[]).is_err());
        assert!(fec.decode(vec![Some(vec![0u8; 4]); 5]).is_err());

        let mut uneven: Vec<Option<Vec<u8>>> =
            fec.encode(b"abcdefgh").unwrap().into_iter().map(Some).collect();
        uneven[2] = Some(vec![0u8; 1]);
        assert!(matches!(fec.decode(uneven), Err(Error::Codec(_))));

        assert!(Fec::new(0, 2).is_err());
        assert!(Fec::new(4, 0).is_err());
    }
}
