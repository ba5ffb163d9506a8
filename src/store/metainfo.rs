//! Region metainfo and the consistency check run before reads and writes.
//!
//! Metainfo is a `RegionMap` of opaque version blobs. A caller that staged a
//! version change expects the store to hold a particular map over the region it
//! touches; if the store holds something else the operation has raced ahead of
//! (or behind) that change and must not proceed.

use super::error::{StoreError, StoreResult};
use super::region::{Region, RegionMap};
use bytes::Bytes;
use tracing::error;

pub type Metainfo = RegionMap<Bytes>;

/// Blob encoding a plain version number.
pub fn version_blob(version: u64) -> Bytes {
    Bytes::copy_from_slice(&version.to_be_bytes())
}

/// Inverse of `version_blob`; `None` for blobs of any other shape.
pub fn blob_version(blob: &Bytes) -> Option<u64> {
    let bytes: [u8; 8] = blob.as_ref().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone)]
pub struct MetainfoChecker {
    region: Region,
    expected: Option<Metainfo>,
}

impl MetainfoChecker {
    /// Expect exactly `expected` over its domain.
    pub fn expecting(expected: Metainfo) -> Self {
        MetainfoChecker {
            region: expected.domain().clone(),
            expected: Some(expected),
        }
    }

    /// Accept whatever the store holds over `region`.
    pub fn trivial(region: Region) -> Self {
        MetainfoChecker {
            region,
            expected: None,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// `actual` is the store's metainfo masked to `self.region()`.
    pub fn check(&self, actual: &Metainfo) -> StoreResult<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        if actual.agrees_with(expected) {
            return Ok(());
        }
        let detail = describe_mismatch(expected, actual);
        error!("metainfo mismatch over {}: {}", self.region, detail);
        Err(StoreError::MetainfoMismatch {
            region: self.region.clone(),
            detail,
        })
    }
}

fn describe_mismatch(expected: &Metainfo, actual: &Metainfo) -> String {
    if expected.domain() != actual.domain() {
        return format!("domain {} != {}", expected.domain(), actual.domain());
    }
    for (r, v) in expected.iter() {
        for (o, ov) in actual.iter() {
            if r.overlaps(o) && v != ov {
                return format!(
                    "at {} expected {:?} found {:?}",
                    r.intersection(o),
                    v.as_ref(),
                    ov.as_ref()
                );
            }
        }
    }
    "pieces disagree".to_string()
}
