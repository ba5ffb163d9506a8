//! Regions of the key space and maps over them.
//!
//! A region is a rectangle: a hash range `[beg, end)` crossed with a key range
//! `[left, right)`. Keys hash with FNV-1a into `[0, HASH_SPACE)`, so a shard can
//! own a hash slice of the whole key range, a key slice of the whole hash
//! space, or both.

use super::key::StoreKey;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

pub const HASH_SPACE: u64 = 1 << 63;

/// Position of a key in the hash space.
///
/// The FNV-1a digest is mixed with the murmur3 finalizer so that short keys
/// spread across the high bits that `split_hash_space` slices on.
pub fn hash_key(key: &StoreKey) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    fmix64(hasher.finish()) % HASH_SPACE
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Exclusive upper end of a key range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RightBound {
    Bounded(StoreKey),
    Unbounded,
}

impl RightBound {
    pub fn is_after(&self, key: &StoreKey) -> bool {
        match self {
            RightBound::Bounded(right) => key < right,
            RightBound::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: StoreKey,
    pub right: RightBound,
}

impl KeyRange {
    pub fn universe() -> Self {
        KeyRange {
            left: StoreKey::min(),
            right: RightBound::Unbounded,
        }
    }

    /// `[left, right)`
    pub fn new(left: StoreKey, right: StoreKey) -> Self {
        KeyRange {
            left,
            right: RightBound::Bounded(right),
        }
    }

    /// `[left, +inf)`
    pub fn starting_at(left: StoreKey) -> Self {
        KeyRange {
            left,
            right: RightBound::Unbounded,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            RightBound::Bounded(right) => *right <= self.left,
            RightBound::Unbounded => false,
        }
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        *key >= self.left && self.right.is_after(key)
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            left: self.left.clone().max(other.left.clone()),
            right: self.right.clone().min(other.right.clone()),
        }
    }

    pub fn is_superset(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.left <= other.left && self.right >= other.right)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub beg: u64,
    pub end: u64,
    pub inner: KeyRange,
}

impl Region {
    pub fn new(beg: u64, end: u64, inner: KeyRange) -> Self {
        Region { beg, end, inner }
    }

    /// Every key at every hash.
    pub fn universe() -> Self {
        Region::new(0, HASH_SPACE, KeyRange::universe())
    }

    pub fn from_key_range(inner: KeyRange) -> Self {
        Region::new(0, HASH_SPACE, inner)
    }

    pub fn hash_slice(beg: u64, end: u64) -> Self {
        Region::new(beg, end, KeyRange::universe())
    }

    /// Split the hash space into `n` equal slices over the whole key range.
    pub fn split_hash_space(n: usize) -> Vec<Region> {
        let n = n.max(1) as u64;
        let step = HASH_SPACE / n;
        (0..n)
            .map(|i| {
                let end = if i + 1 == n { HASH_SPACE } else { (i + 1) * step };
                Region::hash_slice(i * step, end)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.beg >= self.end || self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        let h = hash_key(key);
        self.beg <= h && h < self.end && self.inner.contains_key(key)
    }

    pub fn intersection(&self, other: &Region) -> Region {
        Region {
            beg: self.beg.max(other.beg),
            end: self.end.min(other.end),
            inner: self.inner.intersection(&other.inner),
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn is_superset(&self, other: &Region) -> bool {
        other.is_empty()
            || (self.beg <= other.beg && other.end <= self.end && self.inner.is_superset(&other.inner))
    }

    /// `self` minus `other`, as at most four disjoint rectangles.
    pub fn subtract(&self, other: &Region) -> Vec<Region> {
        let cut = self.intersection(other);
        if cut.is_empty() {
            return if self.is_empty() { Vec::new() } else { vec![self.clone()] };
        }
        let pieces = [
            Region::new(self.beg, cut.beg, self.inner.clone()),
            Region::new(cut.end, self.end, self.inner.clone()),
            Region::new(
                cut.beg,
                cut.end,
                KeyRange {
                    left: self.inner.left.clone(),
                    right: RightBound::Bounded(cut.inner.left.clone()),
                },
            ),
            Region::new(
                cut.beg,
                cut.end,
                KeyRange {
                    left: match &cut.inner.right {
                        RightBound::Bounded(k) => k.clone(),
                        RightBound::Unbounded => StoreKey::max(),
                    },
                    right: match &cut.inner.right {
                        RightBound::Bounded(_) => self.inner.right.clone(),
                        RightBound::Unbounded => RightBound::Bounded(StoreKey::max()),
                    },
                },
            ),
        ];
        pieces.into_iter().filter(|r| !r.is_empty()).collect()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}) x [{:?}, ", self.beg, self.end, self.inner.left.to_string())?;
        match &self.inner.right {
            RightBound::Bounded(k) => write!(f, "{:?})", k.to_string()),
            RightBound::Unbounded => write!(f, "+inf)"),
        }
    }
}

/// A partition of `domain` into disjoint regions, each tagged with a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMap<V> {
    domain: Region,
    pieces: Vec<(Region, V)>,
}

impl<V: Clone> RegionMap<V> {
    /// The whole of `domain` tagged with one value.
    pub fn new(domain: Region, value: V) -> Self {
        let pieces = if domain.is_empty() {
            Vec::new()
        } else {
            vec![(domain.clone(), value)]
        };
        RegionMap { domain, pieces }
    }

    pub fn domain(&self) -> &Region {
        &self.domain
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Region, V)> {
        self.pieces.iter()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// The sub-map over `domain ∩ region`.
    pub fn mask(&self, region: &Region) -> RegionMap<V> {
        let domain = self.domain.intersection(region);
        let pieces = self
            .pieces
            .iter()
            .filter_map(|(r, v)| {
                let cut = r.intersection(region);
                (!cut.is_empty()).then(|| (cut, v.clone()))
            })
            .collect();
        RegionMap { domain, pieces }
    }

    /// Overwrite the sub-domain covered by `new`; the rest is untouched.
    /// `new`'s domain must lie inside ours.
    pub fn update(&mut self, new: RegionMap<V>) {
        debug_assert!(
            self.domain.is_superset(&new.domain),
            "update domain {} outside {}",
            new.domain,
            self.domain
        );
        let mut pieces = Vec::with_capacity(self.pieces.len() + new.pieces.len());
        for (r, v) in self.pieces.drain(..) {
            for rest in r.subtract(&new.domain) {
                pieces.push((rest, v.clone()));
            }
        }
        pieces.extend(new.pieces);
        self.pieces = pieces;
    }

    pub fn lookup_key(&self, key: &StoreKey) -> Option<&V> {
        self.pieces
            .iter()
            .find(|(r, _)| r.contains_key(key))
            .map(|(_, v)| v)
    }

    /// Call `f` for every piece intersecting `region`, clipped to it.
    pub fn visit<F>(&self, region: &Region, mut f: F)
    where
        F: FnMut(&Region, &V),
    {
        for (r, v) in &self.pieces {
            let cut = r.intersection(region);
            if !cut.is_empty() {
                f(&cut, v);
            }
        }
    }

    pub fn map<U, F>(&self, mut f: F) -> RegionMap<U>
    where
        F: FnMut(&V) -> U,
    {
        RegionMap {
            domain: self.domain.clone(),
            pieces: self.pieces.iter().map(|(r, v)| (r.clone(), f(v))).collect(),
        }
    }
}

impl<V: Clone + PartialEq> RegionMap<V> {
    /// Same domain, and every point carries the same value in both maps.
    /// Piece boundaries may differ.
    pub fn agrees_with(&self, other: &RegionMap<V>) -> bool {
        if self.domain != other.domain {
            return false;
        }
        self.pieces.iter().all(|(r, v)| {
            other
                .pieces
                .iter()
                .all(|(o, ov)| !r.overlaps(o) || v == ov)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(left: &str, right: &str) -> Region {
        Region::from_key_range(KeyRange::new(StoreKey::from(left), StoreKey::from(right)))
    }

    #[test]
    fn test_key_range_membership() {
        let r = KeyRange::new(StoreKey::from("b"), StoreKey::from("d"));
        assert!(!r.contains_key(&StoreKey::from("a")));
        assert!(r.contains_key(&StoreKey::from("b")));
        assert!(r.contains_key(&StoreKey::from("c")));
        assert!(!r.contains_key(&StoreKey::from("d")));
        assert!(KeyRange::universe().contains_key(&StoreKey::max()));
    }

    #[test]
    fn test_hash_split_covers_every_key() {
        let slices = Region::split_hash_space(4);
        assert_eq!(slices.last().unwrap().end, HASH_SPACE);
        for i in 0..200 {
            let key = StoreKey::from(format!("key-{}", i));
            let owners = slices.iter().filter(|r| r.contains_key(&key)).count();
            assert_eq!(owners, 1, "key {} owned by {} slices", key, owners);
        }
    }

    #[test]
    fn test_short_keys_spread_over_hash_slices() {
        let slices = Region::split_hash_space(4);
        let mut counts = [0usize; 4];
        for i in 0..40 {
            let key = StoreKey::from(format!("k{:03}", i));
            let owner = slices.iter().position(|r| r.contains_key(&key)).unwrap();
            counts[owner] += 1;
        }
        assert!(counts.iter().all(|&c| c > 0), "counts: {:?}", counts);
    }

    #[test]
    fn test_subtract_leaves_disjoint_remainder() {
        let whole = Region::universe();
        let hole = Region::new(10, 20, KeyRange::new(StoreKey::from("m"), StoreKey::from("p")));
        let rest = whole.subtract(&hole);
        assert!(rest.len() <= 4);
        for (i, a) in rest.iter().enumerate() {
            assert!(!a.overlaps(&hole));
            for b in &rest[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
        assert!(whole.subtract(&whole).is_empty());
    }

    #[test]
    fn test_update_overwrites_only_sub_domain() {
        let mut m = RegionMap::new(keys("a", "z"), 1u32);
        m.update(RegionMap::new(keys("f", "k"), 2u32));
        assert_eq!(m.lookup_key(&StoreKey::from("b")), Some(&1));
        assert_eq!(m.lookup_key(&StoreKey::from("g")), Some(&2));
        assert_eq!(m.lookup_key(&StoreKey::from("x")), Some(&1));
        assert_eq!(m.domain(), &keys("a", "z"));
    }

    #[test]
    fn test_mask_and_agreement() {
        let mut m = RegionMap::new(keys("a", "z"), 1u32);
        m.update(RegionMap::new(keys("f", "k"), 2u32));
        let masked = m.mask(&keys("g", "h"));
        assert_eq!(masked.domain(), &keys("g", "h"));
        assert!(masked.agrees_with(&RegionMap::new(keys("g", "h"), 2)));
        assert!(!masked.agrees_with(&RegionMap::new(keys("g", "h"), 1)));
        assert!(!m.agrees_with(&RegionMap::new(keys("a", "z"), 1)));
    }

    #[test]
    fn test_visit_clips_to_region() {
        let m = RegionMap::new(keys("a", "z"), 7u32);
        let mut seen = Vec::new();
        m.visit(&keys("c", "e"), |r, v| seen.push((r.clone(), *v)));
        assert_eq!(seen, vec![(keys("c", "e"), 7)]);
    }
}
