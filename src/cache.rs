//! Computed routes, kept for a while so the same request doesn't hit the
//! provider again.
//!
//! Entries live in the [`KvStore`] under `route_<key>`, with a small in-memory
//! layer in front so repeated lookups don't need to decode anything.

use std::{
    hash::BuildHasherDefault,
    io::{self, Cursor},
    sync::Arc,
    time::Duration,
};

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use quick_cache::{UnitWeighter, sync::Cache};
use rustc_hash::FxHasher;
use tracing::{debug, info, trace, warn};

use crate::{
    clock::{Clock, Timestamp},
    db::KvStore,
    error::Error,
    model::{Instruction, Location, ManeuverType, Route},
};

pub const KEY_PREFIX: &str = "route_";
const CODEC_VERSION: u8 = 1;
const HOT_CACHE_SIZE: usize = 256;

/// Builds the cache key for a request. Coordinates are rounded to 5 decimals
/// (about a meter), so tiny differences between clicks still share an entry.
pub fn cache_key(origin: Location, waypoint: Option<Location>, destination: Location) -> String {
    let mut key = String::new();
    for loc in [Some(origin), waypoint, Some(destination)].into_iter().flatten() {
        if !key.is_empty() {
            key.push(';');
        }
        key.push_str(&format!("{:.5},{:.5}", loc.lat, loc.lng));
    }
    key
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub route: Arc<Route>,
    pub stored_at: Timestamp,
    pub expires_at: Timestamp,
}
impl CacheEntry {
    /// Valid strictly before `expires_at`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

type HotCache = Cache<String, Arc<CacheEntry>, UnitWeighter, BuildHasherDefault<FxHasher>>;

pub struct RouteCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    hot: HotCache,
}

impl RouteCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hot: Cache::with(
                HOT_CACHE_SIZE,
                HOT_CACHE_SIZE as u64,
                Default::default(),
                Default::default(),
                Default::default(),
            ),
        }
    }

    pub fn put(&self, key: &str, route: Arc<Route>, ttl: Duration) -> eyre::Result<()> {
        let now = self.clock.now();
        let entry = CacheEntry {
            route,
            stored_at: now,
            expires_at: now + ttl,
        };
        let full_key = format!("{KEY_PREFIX}{key}");

        self.store.put(&full_key, &encode_entry(&entry)?)?;
        self.hot.insert(full_key, Arc::new(entry));
        debug!("cached route {key} for {}s", ttl.as_secs());
        Ok(())
    }

    /// Expired and undecodable entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<Arc<Route>> {
        let now = self.clock.now();
        let full_key = format!("{KEY_PREFIX}{key}");

        if let Some(entry) = self.hot.get(full_key.as_str()) {
            if entry.is_expired(now) {
                self.remove(&full_key);
                return None;
            }
            trace!("hot cache hit for {key}");
            return Some(entry.route.clone());
        }

        let entry = self.load(&full_key)?;
        if entry.is_expired(now) {
            debug!("cached route {key} expired");
            self.remove(&full_key);
            return None;
        }

        let route = entry.route.clone();
        self.hot.insert(full_key, Arc::new(entry));
        Some(route)
    }

    /// Drops every entry that has expired by `now`, plus any that can't be
    /// decoded. Returns how many were removed.
    pub fn sweep_expired(&self, now: Timestamp) -> usize {
        let keys = match self.store.keys(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("couldn't list cached routes: {err}");
                return 0;
            }
        };

        let mut removed = 0;
        for full_key in keys {
            let expired = match self.load(&full_key) {
                Some(entry) => entry.is_expired(now),
                // load already removed it
                None => {
                    self.hot.remove(full_key.as_str());
                    removed += 1;
                    continue;
                }
            };
            if expired {
                self.remove(&full_key);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {removed} expired routes from the cache");
        }
        removed
    }

    /// Removes every cached route.
    pub fn clear(&self) -> eyre::Result<usize> {
        let keys = self.store.keys(KEY_PREFIX)?;
        for key in &keys {
            self.store.delete(key)?;
        }
        self.hot.clear();
        info!("Cleared {} cached routes", keys.len());
        Ok(keys.len())
    }

    /// Number of entries in the store that haven't expired yet.
    pub fn len(&self) -> eyre::Result<usize> {
        let now = self.clock.now();
        let mut count = 0;
        for key in self.store.keys(KEY_PREFIX)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            if decode_entry(&bytes).is_ok_and(|e| !e.is_expired(now)) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> eyre::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads and decodes an entry from the store, removing it if it's corrupt.
    fn load(&self, full_key: &str) -> Option<CacheEntry> {
        let bytes = match self.store.get(full_key) {
            Ok(bytes) => bytes?,
            Err(err) => {
                warn!("couldn't read cached route {full_key}: {err}");
                return None;
            }
        };
        match decode_entry(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("{err} ({full_key}), removing it");
                self.remove(full_key);
                None
            }
        }
    }

    fn remove(&self, full_key: &str) {
        self.hot.remove(full_key);
        if let Err(err) = self.store.delete(full_key) {
            warn!("couldn't remove cached route {full_key}: {err}");
        }
    }
}

pub fn encode_entry(entry: &CacheEntry) -> io::Result<Vec<u8>> {
    let route = &entry.route;
    let mut buf = Vec::with_capacity(1 + 8 * 4 + 4 + route.coordinates.len() * 16 + 4);

    buf.write_u8(CODEC_VERSION)?;
    buf.write_u64::<LE>(entry.stored_at.0)?;
    buf.write_u64::<LE>(entry.expires_at.0)?;
    buf.write_f64::<LE>(route.total_distance_m)?;
    buf.write_f64::<LE>(route.total_time_s)?;

    buf.write_u32::<LE>(route.coordinates.len() as u32)?;
    for loc in &route.coordinates {
        write_location(&mut buf, *loc)?;
    }

    buf.write_u32::<LE>(route.steps.len() as u32)?;
    for step in &route.steps {
        buf.write_u8(step.maneuver.to_u8())?;
        buf.write_f64::<LE>(step.distance_m)?;
        buf.write_u32::<LE>(step.text.len() as u32)?;
        buf.extend_from_slice(step.text.as_bytes());
    }

    Ok(buf)
}

pub fn decode_entry(data: &[u8]) -> Result<CacheEntry, Error> {
    let corrupt = |what: &str| Error::CacheCorrupt(what.to_string());
    let mut cur = Cursor::new(data);

    let version = cur.read_u8().map_err(|_| corrupt("empty entry"))?;
    if version != CODEC_VERSION {
        return Err(Error::CacheCorrupt(format!("unknown version {version}")));
    }

    let truncated = |_: io::Error| corrupt("truncated entry");
    let stored_at = Timestamp(cur.read_u64::<LE>().map_err(truncated)?);
    let expires_at = Timestamp(cur.read_u64::<LE>().map_err(truncated)?);
    let total_distance_m = cur.read_f64::<LE>().map_err(truncated)?;
    let total_time_s = cur.read_f64::<LE>().map_err(truncated)?;

    let coord_count = cur.read_u32::<LE>().map_err(truncated)? as usize;
    // each coordinate is 16 bytes, so this catches garbage counts before
    // allocating for them
    if coord_count > data.len() / 16 {
        return Err(corrupt("coordinate count is larger than the entry"));
    }
    let mut coordinates = Vec::with_capacity(coord_count);
    for _ in 0..coord_count {
        coordinates.push(read_location(&mut cur).map_err(truncated)?);
    }

    let step_count = cur.read_u32::<LE>().map_err(truncated)? as usize;
    if step_count > data.len() {
        return Err(corrupt("step count is larger than the entry"));
    }
    let mut steps = Vec::with_capacity(step_count);
    for _ in 0..step_count {
        let maneuver = cur.read_u8().map_err(truncated)?;
        let maneuver = ManeuverType::from_u8(maneuver)
            .ok_or_else(|| Error::CacheCorrupt(format!("unknown maneuver {maneuver}")))?;
        let distance_m = cur.read_f64::<LE>().map_err(truncated)?;
        let text_len = cur.read_u32::<LE>().map_err(truncated)? as usize;

        let start = cur.position() as usize;
        let text = data
            .get(start..start + text_len)
            .ok_or_else(|| corrupt("truncated instruction text"))?;
        let text = String::from_utf8(text.to_vec()).map_err(|_| corrupt("invalid utf-8"))?;
        cur.set_position((start + text_len) as u64);

        steps.push(Instruction {
            text,
            distance_m,
            maneuver,
        });
    }

    if cur.position() as usize != data.len() {
        return Err(corrupt("trailing bytes"));
    }

    Ok(CacheEntry {
        route: Route {
            coordinates,
            total_distance_m,
            total_time_s,
            steps,
        }
        .into_shared(),
        stored_at,
        expires_at,
    })
}

pub(crate) fn write_location(buf: &mut Vec<u8>, loc: Location) -> io::Result<()> {
    buf.write_f64::<LE>(loc.lat)?;
    buf.write_f64::<LE>(loc.lng)
}
pub(crate) fn read_location(cur: &mut Cursor<&[u8]>) -> io::Result<Location> {
    let lat = cur.read_f64::<LE>()?;
    let lng = cur.read_f64::<LE>()?;
    Ok(Location { lat, lng })
}
