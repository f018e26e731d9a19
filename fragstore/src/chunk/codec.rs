//! Chunk codec: digest, encrypt, then split into data / parity / LRC fragments.
//!
//! Layout of an encoded chunk with `d` data, `p` parity and LRC group `g`:
//! - `D0.0 .. D0.{d-1}`: ciphertext split into equal `frag_size` pieces (last one zero padded)
//! - `P0.0 .. P0.{p-1}`: Reed-Solomon parity over the data fragments
//! - `L{n}.0`: XOR of data fragments `n*g .. (n+1)*g`
//!
//! Decoding accepts any subset of fragments. A missing data fragment is first
//! rebuilt from its local group, then Reed-Solomon fills whatever is left.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use bytes::Bytes;
use rand::RngCore;
use reed_solomon_erasure::galois_8::ReedSolomon;
use sha2::{Digest, Sha256, Sha512};

use super::model::{
    ChunkInfo, CipherType, CoderParams, DigestType, EncodedChunk, EncodedFrag, FragDesc, FragId,
    Layer,
};
use crate::error::{Error, Result};

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub fn digest(kind: DigestType, data: &[u8]) -> Option<Vec<u8>> {
    match kind {
        DigestType::Sha256 => Some(Sha256::digest(data).to_vec()),
        DigestType::Sha512 => Some(Sha512::digest(data).to_vec()),
        DigestType::None => None,
    }
}

/// Checks `data` against an expected digest; a missing digest always passes.
pub fn verify_digest(kind: DigestType, expected: Option<&[u8]>, data: &[u8]) -> bool {
    match (expected, digest(kind, data)) {
        (Some(want), Some(got)) => want == got.as_slice(),
        _ => true,
    }
}

fn check_params(params: &CoderParams) -> Result<()> {
    if params.data_frags == 0 {
        return Err(Error::InvalidArgument("data_frags must be positive".into()));
    }
    if params.data_frags + params.parity_frags > 256 {
        return Err(Error::InvalidArgument(format!(
            "too many fragments: {} data + {} parity",
            params.data_frags, params.parity_frags
        )));
    }
    Ok(())
}

pub fn encode(plain: &[u8], params: &CoderParams, dedup: bool) -> Result<EncodedChunk> {
    check_params(params).map_err(|e| Error::EncodeFailed(e.to_string()))?;
    let chunk_digest = digest(params.digest_type, plain);

    let mut body = plain.to_vec();
    let (cipher_key, cipher_iv, cipher_auth_tag) = match params.cipher_type {
        CipherType::Aes256Gcm => {
            let mut key = vec![0u8; KEY_LEN];
            let mut iv = vec![0u8; IV_LEN];
            let mut rng = rand::rng();
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut iv);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut body)
                .map_err(|e| Error::EncodeFailed(format!("encrypt: {e}")))?;
            (Some(key), Some(iv), Some(tag.to_vec()))
        }
        CipherType::None => (None, None, None),
    };

    let d = params.data_frags as usize;
    let frag_size = body.len().div_ceil(d);
    body.resize(frag_size * d, 0);

    let mut shards: Vec<Vec<u8>> = body.chunks(frag_size.max(1)).map(<[u8]>::to_vec).collect();
    shards.resize(d, Vec::new());
    let mut ids: Vec<FragId> = (0..params.data_frags).map(FragId::data).collect();

    if params.parity_frags > 0 && frag_size > 0 {
        let rs = ReedSolomon::new(d, params.parity_frags as usize)
            .map_err(|e| Error::EncodeFailed(format!("reed-solomon: {e:?}")))?;
        shards.extend((0..params.parity_frags).map(|_| vec![0u8; frag_size]));
        rs.encode(&mut shards)
            .map_err(|e| Error::EncodeFailed(format!("reed-solomon: {e:?}")))?;
    } else {
        shards.extend((0..params.parity_frags).map(|_| vec![0u8; frag_size]));
    }
    ids.extend((0..params.parity_frags).map(FragId::parity));

    for group in 0..params.lrc_frags() {
        let members = lrc_members(params, group);
        let mut acc = vec![0u8; frag_size];
        for i in members {
            xor_into(&mut acc, &shards[i]);
        }
        shards.push(acc);
        ids.push(FragId::lrc(group));
    }

    let frags = ids
        .into_iter()
        .zip(shards)
        .map(|(id, data)| EncodedFrag {
            desc: FragDesc {
                id,
                size: data.len() as u64,
                digest: digest(params.digest_type, &data),
            },
            data: Bytes::from(data),
        })
        .collect();

    Ok(EncodedChunk {
        info: ChunkInfo {
            size: plain.len() as u64,
            frag_size: frag_size as u64,
            coder: *params,
            dedup,
            digest: chunk_digest,
            cipher_key,
            cipher_iv,
            cipher_auth_tag,
        },
        frags,
    })
}

/// Rebuilds the chunk plaintext from whatever fragments are available.
pub fn decode(info: &ChunkInfo, frags: &[EncodedFrag]) -> Result<Bytes> {
    let params = &info.coder;
    check_params(params).map_err(|e| Error::DecodeFailed(e.to_string()))?;
    let d = params.data_frags as usize;
    let p = params.parity_frags as usize;
    let frag_size = info.frag_size as usize;

    let mut data: Vec<Option<Vec<u8>>> = vec![None; d];
    let mut parity: Vec<Option<Vec<u8>>> = vec![None; p];
    let mut lrc: Vec<Option<Vec<u8>>> = vec![None; params.lrc_frags() as usize];

    for f in frags {
        if f.data.len() != frag_size
            || !verify_digest(params.digest_type, f.desc.digest.as_deref(), &f.data)
        {
            tracing::debug!(frag = %f.desc.id, "dropping corrupt fragment");
            continue;
        }
        let slot = match f.desc.id.layer {
            Layer::Data => data.get_mut(f.desc.id.frag as usize),
            Layer::Parity => parity.get_mut(f.desc.id.frag as usize),
            Layer::Lrc => lrc.get_mut(f.desc.id.layer_n as usize),
        };
        if let Some(slot) = slot {
            *slot = Some(f.data.to_vec());
        }
    }

    // 先用本地组修复单个缺失的数据分片
    for (group, local) in lrc.iter().enumerate() {
        let Some(local) = local else { continue };
        let members = lrc_members(params, group as u32);
        let missing: Vec<usize> = members.clone().filter(|&i| data[i].is_none()).collect();
        if missing.len() != 1 {
            continue;
        }
        let mut acc = local.clone();
        for i in members.filter(|&i| i != missing[0]) {
            if let Some(buf) = &data[i] {
                xor_into(&mut acc, buf);
            }
        }
        data[missing[0]] = Some(acc);
    }

    if data.iter().any(Option::is_none) {
        let present = data.iter().chain(parity.iter()).filter(|s| s.is_some()).count();
        if p == 0 || present < d {
            return Err(Error::DecodeFailed(format!(
                "only {present} of {d} required fragments available"
            )));
        }
        let rs = ReedSolomon::new(d, p)
            .map_err(|e| Error::DecodeFailed(format!("reed-solomon: {e:?}")))?;
        let mut shards: Vec<Option<Vec<u8>>> = data.into_iter().chain(parity).collect();
        rs.reconstruct_data(&mut shards)
            .map_err(|e| Error::DecodeFailed(format!("reed-solomon: {e:?}")))?;
        shards.truncate(d);
        data = shards;
    }

    let mut body: Vec<u8> = Vec::with_capacity(frag_size * d);
    for shard in data.into_iter().flatten() {
        body.extend_from_slice(&shard);
    }
    body.truncate(info.size as usize);

    if params.cipher_type == CipherType::Aes256Gcm {
        let (key, iv, tag) = match (&info.cipher_key, &info.cipher_iv, &info.cipher_auth_tag) {
            (Some(k), Some(i), Some(t)) if k.len() == KEY_LEN && i.len() == IV_LEN && t.len() == TAG_LEN => {
                (k, i, t)
            }
            _ => return Err(Error::DecodeFailed("missing or malformed cipher metadata".into())),
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut body, Tag::from_slice(tag))
            .map_err(|e| Error::DecodeFailed(format!("decrypt: {e}")))?;
    }

    if !verify_digest(params.digest_type, info.digest.as_deref(), &body) {
        return Err(Error::DecodeFailed("chunk digest mismatch".into()));
    }
    Ok(Bytes::from(body))
}

fn lrc_members(params: &CoderParams, group: u32) -> std::ops::Range<usize> {
    let g = params.lrc_group as usize;
    let start = group as usize * g;
    start..(start + g).min(params.data_frags as usize)
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn keep(chunk: &EncodedChunk, ids: &[FragId]) -> Vec<EncodedFrag> {
        chunk
            .frags
            .iter()
            .filter(|f| ids.contains(&f.desc.id))
            .cloned()
            .collect()
    }

    #[test]
    fn test_round_trip_all_fragments() {
        let data = sample(10_007);
        let enc = encode(&data, &CoderParams::default(), true).unwrap();
        assert_eq!(enc.frags.len(), 8);
        assert!(enc.info.cipher_key.is_some());
        assert_eq!(decode(&enc.info, &enc.frags).unwrap(), data);
    }

    #[test]
    fn test_any_data_frags_sized_subset_decodes() {
        let data = sample(4099);
        let params = CoderParams {
            lrc_group: 0,
            ..CoderParams::default()
        };
        let enc = encode(&data, &params, false).unwrap();
        let all: Vec<FragId> = enc.frags.iter().map(|f| f.desc.id).collect();
        // every 4-of-6 subset
        for mask in 0u32..64 {
            if mask.count_ones() != 4 {
                continue;
            }
            let ids: Vec<FragId> = (0..6).filter(|i| mask & (1 << i) != 0).map(|i| all[i]).collect();
            let out = decode(&enc.info, &keep(&enc, &ids)).unwrap();
            assert_eq!(out, data, "subset {mask:#b}");
        }
    }

    #[test]
    fn test_lrc_repairs_without_parity() {
        let data = sample(8000);
        let enc = encode(&data, &CoderParams::default(), true).unwrap();
        let ids = [FragId::data(0), FragId::data(2), FragId::data(3), FragId::lrc(0)];
        assert_eq!(decode(&enc.info, &keep(&enc, &ids)).unwrap(), data);
    }

    #[test]
    fn test_too_few_fragments_fails() {
        let data = sample(5000);
        let enc = encode(&data, &CoderParams::default(), true).unwrap();
        let ids = [FragId::data(0), FragId::data(1), FragId::parity(0)];
        let err = decode(&enc.info, &keep(&enc, &ids)).unwrap_err();
        assert!(matches!(err, Error::DecodeFailed(_)));
    }

    #[test]
    fn test_corrupt_fragment_is_dropped_and_rebuilt() {
        let data = sample(6000);
        let enc = encode(&data, &CoderParams::default(), true).unwrap();
        let mut frags = enc.frags.clone();
        let mut bad = frags[1].data.to_vec();
        bad[0] ^= 0xff;
        frags[1].data = Bytes::from(bad);
        assert_eq!(decode(&enc.info, &frags).unwrap(), data);
    }

    #[test]
    fn test_tampered_auth_tag_fails() {
        let data = sample(3000);
        let mut enc = encode(&data, &CoderParams::default(), true).unwrap();
        if let Some(tag) = enc.info.cipher_auth_tag.as_mut() {
            tag[0] ^= 1;
        }
        assert!(matches!(decode(&enc.info, &enc.frags), Err(Error::DecodeFailed(_))));
    }

    #[test]
    fn test_plain_encoding_is_deterministic() {
        let params = CoderParams {
            cipher_type: CipherType::None,
            ..CoderParams::default()
        };
        let data = sample(2048);
        let a = encode(&data, &params, true).unwrap();
        let b = encode(&data, &params, true).unwrap();
        assert_eq!(a.info, b.info);
        let da: Vec<_> = a.frags.iter().map(|f| f.data.clone()).collect();
        let db: Vec<_> = b.frags.iter().map(|f| f.data.clone()).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn test_empty_chunk_round_trip() {
        let enc = encode(&[], &CoderParams::default(), false).unwrap();
        assert_eq!(enc.info.frag_size, 0);
        assert!(decode(&enc.info, &enc.frags).unwrap().is_empty());
    }
}
