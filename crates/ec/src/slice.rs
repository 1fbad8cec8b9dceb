//! Reed-Solomon slice math over whole-object byte buffers.

use crate::{Error, Result};
use cluster::EcConf;

/// Per-slice byte count for an object: the object is split across the
/// data slices, padded so every slice is equal-sized and SIMD-friendly.
pub fn slice_size(obj_size: usize, data_slices: usize) -> usize {
    let per = obj_size.div_ceil(data_slices);
    per.div_ceil(64) * 64
}

/// Split and encode: returns `data + parity` equal-sized slices,
/// in slice-id order (data first).
pub fn split(obj: &[u8], conf: &EcConf) -> Result<Vec<Vec<u8>>> {
    let (data, parity) = (conf.data_slices, conf.parity_slices);
    let size = slice_size(obj.len(), data);

    let mut slices: Vec<Vec<u8>> = Vec::with_capacity(data + parity);
    for i in 0..data {
        let start = (i * size).min(obj.len());
        let end = ((i + 1) * size).min(obj.len());
        let mut s = obj[start..end].to_vec();
        s.resize(size, 0);
        slices.push(s);
    }

    let recovery = reed_solomon_simd::encode(data, parity, slices.iter())
        .map_err(|e| Error::Codec(e.to_string()))?;
    slices.extend(recovery);
    Ok(slices)
}

/// Restore the original object (and every missing slice) from whatever
/// subset survived. `slices[i]` is slice `i` (data first, then parity),
/// `None` where lost. Returns `(object, complete slice set)`.
pub fn restore(
    mut slices: Vec<Option<Vec<u8>>>,
    conf: &EcConf,
    obj_size: usize,
) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    let (data, parity) = (conf.data_slices, conf.parity_slices);
    debug_assert_eq!(slices.len(), data + parity);

    let have = slices.iter().filter(|s| s.is_some()).count();
    if have < data {
        return Err(Error::Codec(format!(
            "{have} of {data} required slices present"
        )));
    }

    let missing_data = slices[..data].iter().any(|s| s.is_none());
    if missing_data {
        let original = slices[..data]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)));
        let recovery = slices[data..]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)));

        let restored = reed_solomon_simd::decode(data, parity, original, recovery)
            .map_err(|e| Error::Codec(e.to_string()))?;
        for (idx, shard) in restored {
            slices[idx] = Some(shard);
        }
    }

    // Re-derive any missing parity from the now-complete data set.
    if slices[data..].iter().any(|s| s.is_none()) {
        let recovery =
            reed_solomon_simd::encode(data, parity, slices[..data].iter().map(|s| s.as_ref().unwrap()))
                .map_err(|e| Error::Codec(e.to_string()))?;
        for (i, shard) in recovery.into_iter().enumerate() {
            if slices[data + i].is_none() {
                slices[data + i] = Some(shard);
            }
        }
    }

    let full: Vec<Vec<u8>> = slices.into_iter().map(|s| s.unwrap()).collect();
    let mut obj = Vec::with_capacity(obj_size);
    for s in &full[..data] {
        obj.extend_from_slice(s);
    }
    obj.truncate(obj_size);
    Ok((obj, full))
}

#[cfg(test)]
mod test {
    use super::*;

    fn conf(data: usize, parity: usize) -> EcConf {
        EcConf {
            enabled: true,
            obj_size_limit: 0,
            data_slices: data,
            parity_slices: parity,
        }
    }

    fn body(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn slice_size_padding() {
        assert_eq!(slice_size(1, 2), 64);
        assert_eq!(slice_size(128, 2), 64);
        assert_eq!(slice_size(129, 2), 128);
        assert_eq!(slice_size(1000, 3), 384);
    }

    #[test]
    fn split_restore_with_losses() {
        let conf = conf(2, 2);
        let obj = body(100_000);
        let slices = split(&obj, &conf).unwrap();
        assert_eq!(slices.len(), 4);

        // Lose one data and one parity slice (= parity count).
        let mut have: Vec<Option<Vec<u8>>> = slices.into_iter().map(Some).collect();
        have[0] = None;
        have[3] = None;

        let (restored, full) = restore(have, &conf, obj.len()).unwrap();
        assert_eq!(restored, obj);
        assert_eq!(full.len(), 4);

        // The regenerated set equals a fresh split.
        let again = split(&obj, &conf).unwrap();
        assert_eq!(full, again);
    }

    #[test]
    fn too_many_losses_fail() {
        let conf = conf(2, 1);
        let slices = split(&body(5000), &conf).unwrap();
        let mut have: Vec<Option<Vec<u8>>> = slices.into_iter().map(Some).collect();
        have[0] = None;
        have[2] = None;
        assert!(restore(have, &conf, 5000).is_err());
    }

    #[test]
    fn small_object_single_data_slice() {
        let conf = conf(1, 2);
        let obj = b"tiny".to_vec();
        let slices = split(&obj, &conf).unwrap();
        assert_eq!(slices.len(), 3);

        let mut have: Vec<Option<Vec<u8>>> = slices.into_iter().map(Some).collect();
        have[0] = None; // only parity remains
        have[1] = None;
        let (restored, _) = restore(have, &conf, obj.len()).unwrap();
        assert_eq!(restored, obj);
    }
}
