//! The most recent position fixes, persisted so there's still a last known
//! position after a restart or while the position source has no fix.

use std::{
    collections::VecDeque,
    io::{self, Cursor},
    sync::Arc,
};

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::{
    cache::{read_location, write_location},
    clock::Timestamp,
    db::KvStore,
    error::Error,
    model::{Location, PositionFix},
};

pub const TRAIL_KEY: &str = "gps_trail";
pub const TRAIL_CAPACITY: usize = 100;
const CODEC_VERSION: u8 = 1;

pub struct PositionTrail {
    store: Arc<dyn KvStore>,
    fixes: VecDeque<PositionFix>,
}

impl PositionTrail {
    /// Loads whatever trail was persisted in `store` before.
    pub fn open(store: Arc<dyn KvStore>) -> Self {
        let fixes = match store.get(TRAIL_KEY) {
            Ok(Some(data)) => decode_trail(&data).unwrap_or_else(|err| {
                warn!("{err}, starting with an empty trail");
                VecDeque::new()
            }),
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!("couldn't read the position trail: {err}");
                VecDeque::new()
            }
        };
        debug!("loaded {} fixes from the position trail", fixes.len());
        Self { store, fixes }
    }

    /// Appends a fix, evicting the oldest one once the trail is full, and
    /// persists the trail.
    pub fn record(&mut self, fix: PositionFix) {
        if self.fixes.len() == TRAIL_CAPACITY {
            self.fixes.pop_front();
        }
        self.fixes.push_back(fix);
        self.persist();
    }

    pub fn last_known(&self) -> Option<PositionFix> {
        self.fixes.back().copied()
    }

    pub fn fixes(&self) -> impl Iterator<Item = &PositionFix> {
        self.fixes.iter()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn clear(&mut self) {
        self.fixes.clear();
        if let Err(err) = self.store.delete(TRAIL_KEY) {
            warn!("couldn't clear the position trail: {err}");
        }
    }

    /// Failing to persist only loses the trail across restarts, so it's
    /// logged rather than returned.
    fn persist(&self) {
        let res = encode_trail(&self.fixes)
            .map_err(eyre::Report::from)
            .and_then(|data| self.store.put(TRAIL_KEY, &data));
        if let Err(err) = res {
            warn!("couldn't save the position trail: {err}");
        }
    }
}

fn encode_trail(fixes: &VecDeque<PositionFix>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1 + 4 + fixes.len() * 32);
    buf.write_u8(CODEC_VERSION)?;
    buf.write_u32::<LE>(fixes.len() as u32)?;
    for fix in fixes {
        write_location(&mut buf, fix.location)?;
        buf.write_f64::<LE>(fix.accuracy_m)?;
        buf.write_u64::<LE>(fix.timestamp.0)?;
    }
    Ok(buf)
}

fn decode_trail(data: &[u8]) -> Result<VecDeque<PositionFix>, Error> {
    let corrupt = |_: io::Error| Error::CacheCorrupt("truncated position trail".to_string());
    let mut cur = Cursor::new(data);

    let version = cur.read_u8().map_err(corrupt)?;
    if version != CODEC_VERSION {
        return Err(Error::CacheCorrupt(format!(
            "unknown position trail version {version}"
        )));
    }
    let count = (cur.read_u32::<LE>().map_err(corrupt)? as usize).min(TRAIL_CAPACITY);

    let mut fixes = VecDeque::with_capacity(count);
    for _ in 0..count {
        let location: Location = read_location(&mut cur).map_err(corrupt)?;
        let accuracy_m = cur.read_f64::<LE>().map_err(corrupt)?;
        let timestamp = Timestamp(cur.read_u64::<LE>().map_err(corrupt)?);
        fixes.push_back(PositionFix::new(location, accuracy_m, timestamp));
    }
    Ok(fixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn fix(i: u64) -> PositionFix {
        PositionFix::new(
            Location::new(3.62 + i as f64 * 0.0001, -76.30),
            12.,
            Timestamp(i * 1_000),
        )
    }

    #[test]
    fn test_keeps_the_last_hundred_fixes() {
        let store = Arc::new(MemoryStore::new());
        let mut trail = PositionTrail::open(store);
        assert!(trail.last_known().is_none());

        for i in 0..150 {
            trail.record(fix(i));
        }
        assert_eq!(trail.len(), TRAIL_CAPACITY);
        assert_eq!(trail.fixes().next(), Some(&fix(50)));
        assert_eq!(trail.last_known(), Some(fix(149)));
    }

    #[test]
    fn test_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let mut trail = PositionTrail::open(store.clone());
        for i in 0..120 {
            trail.record(fix(i));
        }
        drop(trail);

        let trail = PositionTrail::open(store);
        assert_eq!(trail.len(), TRAIL_CAPACITY);
        assert_eq!(trail.last_known(), Some(fix(119)));
    }

    #[test]
    fn test_clear() {
        let store = Arc::new(MemoryStore::new());
        let mut trail = PositionTrail::open(store.clone());
        trail.record(fix(1));
        trail.clear();
        assert!(trail.is_empty());
        assert_eq!(store.get(TRAIL_KEY).unwrap(), None);
    }

    #[test]
    fn test_encoded_layout() {
        let fixes = (0..3).map(fix).collect::<VecDeque<_>>();
        let data = encode_trail(&fixes).unwrap();
        assert_eq!(data.len(), 1 + 4 + 3 * 32);
        assert_eq!(&data[..5], &[CODEC_VERSION, 3, 0, 0, 0]);
        assert_eq!(&data[data.len() - 8..], &2_000u64.to_le_bytes());
        assert_eq!(decode_trail(&data).unwrap(), fixes);
    }

    #[test]
    fn test_corrupt_trail_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put(TRAIL_KEY, &[CODEC_VERSION, 5, 0, 0, 0, 1]).unwrap();
        let trail = PositionTrail::open(store);
        assert!(trail.is_empty());
    }
}
