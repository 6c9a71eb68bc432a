use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{error::Error, geo_index::GeoIndex, model::Route};

/// A snapshot of the candidates returned for one request, and which one is
/// selected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteSet {
    pub candidates: Vec<Arc<Route>>,
    /// Whether each candidate avoids every blocked zone.
    pub valid: Vec<bool>,
    /// Only ever points at a valid candidate.
    pub selected: Option<usize>,
}
impl RouteSet {
    pub fn current(&self) -> Option<&Arc<Route>> {
        self.selected.map(|i| &self.candidates[i])
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

pub struct RouteStore {
    set: RouteSet,
    sample_stride: usize,
}

impl RouteStore {
    pub fn new(sample_stride: usize) -> Self {
        Self {
            set: RouteSet::default(),
            sample_stride,
        }
    }

    /// Replaces the candidates and selects the first one that doesn't cross a
    /// blocked zone. The candidates are kept even if none of them are valid.
    pub fn set_candidates(&mut self, routes: Vec<Arc<Route>>, geo: &GeoIndex) -> Result<(), Error> {
        self.set = RouteSet {
            valid: Vec::new(),
            candidates: routes,
            selected: None,
        };
        self.refresh_validity(geo);
        self.set.selected = self.set.valid.iter().position(|v| *v);

        info!(
            "{} candidate routes, {} valid",
            self.set.candidates.len(),
            self.set.valid_count()
        );

        if self.set.selected.is_none() {
            return Err(Error::NoValidRoute);
        }
        Ok(())
    }

    /// Moves to the next valid candidate after the current one, wrapping
    /// around to the first valid one.
    pub fn select_next(&mut self, geo: &GeoIndex) -> Result<Arc<Route>, Error> {
        self.refresh_validity(geo);
        if self.set.valid_count() < 2 {
            return Err(Error::NoAlternative);
        }

        let valid = &self.set.valid;
        let after = self.set.selected.map(|i| i + 1).unwrap_or(0);
        let next = (after..valid.len())
            .find(|&i| valid[i])
            .or_else(|| valid.iter().position(|v| *v))
            .ok_or(Error::NoAlternative)?;

        debug!("switching route {:?} -> {next}", self.set.selected);
        self.set.selected = Some(next);
        Ok(self.set.candidates[next].clone())
    }

    /// Recomputes validity after zones were (un)blocked. If the selected
    /// route now crosses a blocked zone, the selection moves to the first
    /// valid candidate, or is cleared if there are none.
    ///
    /// Returns whether the selection changed.
    pub fn revalidate(&mut self, geo: &GeoIndex) -> bool {
        self.refresh_validity(geo);

        let before = self.set.selected;
        match before {
            Some(i) if self.set.valid[i] => {}
            Some(_) => {
                self.set.selected = self.set.valid.iter().position(|v| *v);
                warn!(
                    "selected route now crosses a blocked zone, moved to {:?}",
                    self.set.selected
                );
            }
            // nothing was valid before, but something might be now
            None => self.set.selected = self.set.valid.iter().position(|v| *v),
        }
        before != self.set.selected
    }

    pub fn current(&self) -> Option<Arc<Route>> {
        self.set.current().cloned()
    }

    pub fn sample_stride(&self) -> usize {
        self.sample_stride
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.set.selected
    }

    pub fn candidates(&self) -> &[Arc<Route>] {
        &self.set.candidates
    }

    pub fn valid_count(&self) -> usize {
        self.set.valid_count()
    }

    /// 1-based position of the selected route among the valid ones, for
    /// showing "route 2 of 3".
    pub fn position_among_valid(&self) -> Option<(usize, usize)> {
        let selected = self.set.selected?;
        let position = self.set.valid[..=selected].iter().filter(|v| **v).count();
        Some((position, self.set.valid_count()))
    }

    pub fn route_set(&self) -> RouteSet {
        self.set.clone()
    }

    /// Drops every candidate, for example because an endpoint changed.
    pub fn invalidate(&mut self) {
        self.set = RouteSet::default();
    }

    fn refresh_validity(&mut self, geo: &GeoIndex) {
        self.set.valid = self
            .set
            .candidates
            .iter()
            .enumerate()
            .map(|(i, route)| match geo.route_crosses_blocked(route, self.sample_stride) {
                Some(zone) => {
                    debug!("candidate {i} crosses blocked zone {zone}");
                    false
                }
                None => true,
            })
            .collect();
    }
}
