//! Backfill: streaming one replica's newer data into another.
//!
//! The destination describes what it already has as a `StartPoint`: the state
//! timestamp it believes for each sub-region. The source sends every key whose
//! recency is strictly newer, as atoms split into size-bounded chunks. The
//! destination applies atoms as they come; it never compares timestamps.

use super::error::{StoreError, StoreResult};
use super::key::{ReplTimestamp, StateTimestamp, StoreKey};
use super::metainfo::Metainfo;
use super::order::OrderToken;
use super::protocol::StoreView;
use super::region::RegionMap;
use crate::query::Datum;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One key's full state at a point in causal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillAtom {
    pub key: StoreKey,
    pub value: Datum,
    pub recency: ReplTimestamp,
}

impl BackfillAtom {
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.estimated_size() + 8
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillChunk {
    pub atoms: Vec<BackfillAtom>,
}

impl BackfillChunk {
    pub fn size_bytes(&self) -> usize {
        self.atoms.iter().map(BackfillAtom::size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::UnsupportedChunk(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::UnsupportedChunk(e.to_string()))
    }
}

/// What the destination already holds, per sub-region.
pub type StartPoint = RegionMap<StateTimestamp>;

/// Split `atoms` into chunks of at most `max_bytes`, keeping order. An atom
/// larger than `max_bytes` travels alone.
pub fn chunk_atoms(atoms: Vec<BackfillAtom>, max_bytes: usize) -> Vec<BackfillChunk> {
    let mut chunks = Vec::new();
    let mut current = BackfillChunk::default();
    let mut current_bytes = 0;
    for atom in atoms {
        let size = atom.size_bytes();
        if !current.is_empty() && current_bytes + size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.atoms.push(atom);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Receiving end of `StoreView::send_backfill`.
pub trait SendBackfillCallback: Send {
    /// Sees the source's metainfo over the start point's domain; returning
    /// false skips the backfill.
    fn should_backfill(&mut self, metainfo: &Metainfo) -> bool;

    fn send_chunk<'a>(
        &'a mut self,
        chunk: BackfillChunk,
        interruptor: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>>;
}

/// Keeps every chunk in memory.
#[derive(Debug, Default)]
pub struct ChunkCollector {
    pub chunks: Vec<BackfillChunk>,
    pub metainfo: Option<Metainfo>,
    refuse: bool,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector that declines every backfill.
    pub fn refusing() -> Self {
        ChunkCollector {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn atoms(&self) -> impl Iterator<Item = &BackfillAtom> {
        self.chunks.iter().flat_map(|c| c.atoms.iter())
    }
}

impl SendBackfillCallback for ChunkCollector {
    fn should_backfill(&mut self, metainfo: &Metainfo) -> bool {
        self.metainfo = Some(metainfo.clone());
        !self.refuse
    }

    fn send_chunk<'a>(
        &'a mut self,
        chunk: BackfillChunk,
        _interruptor: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.chunks.push(chunk);
            Ok(())
        })
    }
}

/// Forwards chunks into a destination store.
struct StorePipe<'d> {
    dest: &'d dyn StoreView,
    metainfo: Option<Metainfo>,
    atoms: usize,
}

impl SendBackfillCallback for StorePipe<'_> {
    fn should_backfill(&mut self, metainfo: &Metainfo) -> bool {
        self.metainfo = Some(metainfo.clone());
        true
    }

    fn send_chunk<'a>(
        &'a mut self,
        chunk: BackfillChunk,
        interruptor: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.atoms += chunk.atoms.len();
            let token = self.dest.new_write_token();
            self.dest.receive_backfill(chunk, token, interruptor).await
        })
    }
}

/// Bring `dest` up to date from `source` over `start_point`'s domain, then
/// give `dest` the source's metainfo for that domain. Returns the number of
/// atoms applied.
pub async fn backfill_between(
    source: &dyn StoreView,
    dest: &dyn StoreView,
    start_point: &StartPoint,
    interruptor: &CancellationToken,
) -> StoreResult<usize> {
    if !dest.region().is_superset(start_point.domain()) {
        return Err(StoreError::RegionMismatch {
            requested: start_point.domain().clone(),
            store: dest.region().clone(),
        });
    }
    debug!("backfill starting over {}", start_point.domain());
    let mut pipe = StorePipe {
        dest,
        metainfo: None,
        atoms: 0,
    };
    let token = source.new_read_token();
    let sent = source
        .send_backfill(start_point, &mut pipe, token, interruptor)
        .await?;
    if !sent {
        return Ok(0);
    }
    if let Some(metainfo) = pipe.metainfo.take() {
        let token = dest.new_write_token();
        dest.set_metainfo(metainfo, OrderToken::IGNORE, token, interruptor)
            .await?;
    }
    info!("backfill applied {} atoms over {}", pipe.atoms, start_point.domain());
    Ok(pipe.atoms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(i: usize, payload: usize) -> BackfillAtom {
        BackfillAtom {
            key: StoreKey::from(format!("k{}", i)),
            value: Datum::from("x".repeat(payload)),
            recency: ReplTimestamp(i as u64),
        }
    }

    #[test]
    fn test_chunking_respects_size_and_order() {
        let atoms: Vec<_> = (0..10).map(|i| atom(i, 40)).collect();
        let per_atom = atoms[0].size_bytes();
        let chunks = chunk_atoms(atoms.clone(), per_atom * 3);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.size_bytes() <= per_atom * 3));
        let flat: Vec<_> = chunks.into_iter().flat_map(|c| c.atoms).collect();
        assert_eq!(flat, atoms);
    }

    #[test]
    fn test_oversized_atom_travels_alone() {
        let chunks = chunk_atoms(vec![atom(0, 10), atom(1, 1000), atom(2, 10)], 64);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].atoms.len(), 1);
    }

    #[test]
    fn test_chunk_wire_format() {
        let chunk = BackfillChunk {
            atoms: vec![atom(1, 3)],
        };
        let decoded = BackfillChunk::from_bytes(&chunk.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, chunk);
        assert!(matches!(
            BackfillChunk::from_bytes(&[0xFF]),
            Err(StoreError::UnsupportedChunk(_))
        ));
    }
}
