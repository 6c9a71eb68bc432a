//! Follows a position stream along the active route.
//!
//! The tracker has no internal concurrency. Whoever owns it feeds it one
//! position at a time, which is at most about once a second, so the linear
//! scans here are fine even for routes with a few thousand points.

use std::{collections::VecDeque, sync::Arc};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    clock::Timestamp,
    config::{BREADCRUMB_CAPACITY, TrackerConfig},
    error::Error,
    math::approx_distance_sqr,
    model::{Location, Route},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Idle,
    Tracking,
    Completed,
}
impl TrackerState {
    fn name(self) -> &'static str {
        match self {
            TrackerState::Idle => "idle",
            TrackerState::Tracking => "tracking",
            TrackerState::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub traveled_m: f64,
    pub total_m: f64,
    /// Between 0 and 100
    pub percent: f64,
    pub remaining_m: f64,
    pub deviation_m: f64,
    /// The route's estimated time, scaled by how much of it is left.
    pub remaining_time_s: f64,
    pub next_instruction: Option<usize>,
    pub next_instruction_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TrackerEvent {
    RouteDeviation {
        deviation_m: f64,
        position: Location,
        timestamp: Timestamp,
    },
    RouteCompleted {
        traveled_m: f64,
        timestamp: Timestamp,
    },
    /// The maneuver for this instruction is within the voice alert distance.
    InstructionAhead {
        index: usize,
        distance_m: f64,
        text: String,
        /// Turns, forks and roundabouts, which should interrupt whatever is
        /// being announced.
        priority: bool,
    },
}

struct ProgressState {
    route: Arc<Route>,
    /// Polyline length from the first coordinate up to each coordinate.
    cumulative_m: Vec<f64>,
    /// Distance along the route at which each instruction's maneuver happens.
    maneuver_at_m: Vec<f64>,
    /// Furthest coordinate index reached so far.
    max_index: usize,
    traveled_m: f64,
    deviation_m: f64,
    last_update: Option<Timestamp>,
    breadcrumbs: VecDeque<Location>,
    /// Instructions before this one have already been announced.
    next_to_announce: usize,
}

impl ProgressState {
    fn new(route: Arc<Route>) -> Self {
        let mut cumulative_m = Vec::with_capacity(route.coordinates.len().max(1));
        cumulative_m.push(0.);
        for w in route.coordinates.windows(2) {
            let prev = *cumulative_m.last().unwrap_or(&0.);
            cumulative_m.push(prev + w[0].distance_to(w[1]));
        }

        let mut maneuver_at_m = Vec::with_capacity(route.steps.len());
        let mut offset = 0.;
        for step in &route.steps {
            maneuver_at_m.push(offset);
            offset += step.distance_m;
        }

        Self {
            route,
            cumulative_m,
            maneuver_at_m,
            max_index: 0,
            traveled_m: 0.,
            deviation_m: 0.,
            last_update: None,
            breadcrumbs: VecDeque::with_capacity(BREADCRUMB_CAPACITY),
            // the first instruction is the departure, which is never "ahead"
            next_to_announce: 1,
        }
    }

    fn total_m(&self) -> f64 {
        self.route.total_distance_m
    }

    fn push_breadcrumb(&mut self, position: Location) {
        if self.breadcrumbs.len() == BREADCRUMB_CAPACITY {
            self.breadcrumbs.pop_front();
        }
        self.breadcrumbs.push_back(position);
    }

    /// Index of the route coordinate closest to `position`.
    fn nearest_index(&self, position: Location) -> Option<usize> {
        let lng_m_per_degree = position.calculate_lng_m_per_degree();
        self.route
            .coordinates
            .iter()
            .map(|c| approx_distance_sqr(position, *c, lng_m_per_degree))
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// The first instruction whose maneuver is still ahead of us.
    fn next_instruction(&self) -> Option<(usize, f64)> {
        self.maneuver_at_m
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, at)| **at > self.traveled_m)
            .map(|(i, at)| (i, at - self.traveled_m))
    }

    fn is_at_end(&self, epsilon: f64) -> bool {
        let last_index = self.route.coordinates.len().saturating_sub(1);
        self.traveled_m >= self.total_m() * (1. - epsilon)
            || (last_index > 0 && self.max_index == last_index)
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let total_m = self.total_m();
        let fraction = if total_m > 0. {
            (self.traveled_m / total_m).min(1.)
        } else {
            0.
        };
        let next = self.next_instruction();

        ProgressSnapshot {
            traveled_m: self.traveled_m,
            total_m,
            percent: fraction * 100.,
            remaining_m: (total_m - self.traveled_m).max(0.),
            deviation_m: self.deviation_m,
            remaining_time_s: self.route.total_time_s * (1. - fraction),
            next_instruction: next.map(|(i, _)| i),
            next_instruction_m: next.map(|(_, d)| d),
        }
    }
}

enum Phase {
    Idle,
    Tracking(ProgressState),
    Completed(ProgressState),
}

pub struct ProgressTracker {
    config: TrackerConfig,
    phase: Phase,
    events: Option<UnboundedSender<TrackerEvent>>,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            events: None,
        }
    }

    /// Deviation, completion and upcoming-instruction events get sent to the
    /// returned receiver. Only the latest subscriber gets them.
    pub fn subscribe(&mut self) -> UnboundedReceiver<TrackerEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.events = Some(tx);
        rx
    }

    pub fn state(&self) -> TrackerState {
        match self.phase {
            Phase::Idle => TrackerState::Idle,
            Phase::Tracking(_) => TrackerState::Tracking,
            Phase::Completed(_) => TrackerState::Completed,
        }
    }

    pub fn begin(&mut self, route: Arc<Route>) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(self.invalid_state(TrackerState::Idle));
        }

        info!(
            "Tracking route: {:.1}km, {} points",
            route.total_distance_m / 1000.,
            route.coordinates.len()
        );
        self.phase = Phase::Tracking(ProgressState::new(route));
        Ok(())
    }

    pub fn update(
        &mut self,
        position: Location,
        timestamp: Timestamp,
    ) -> Result<ProgressSnapshot, Error> {
        let Phase::Tracking(state) = &mut self.phase else {
            return Err(self.invalid_state(TrackerState::Tracking));
        };

        state.push_breadcrumb(position);
        state.last_update = Some(timestamp);

        let mut events = Vec::new();

        if let Some(i) = state.nearest_index(position) {
            // never go backwards, a noisy fix behind us shouldn't undo progress
            state.max_index = state.max_index.max(i);
            state.traveled_m = state.cumulative_m[state.max_index];
            state.deviation_m = position.distance_to(state.route.coordinates[i]);
        }

        if state.deviation_m > self.config.deviation_threshold_m {
            warn!("{:.0}m off the route", state.deviation_m);
            events.push(TrackerEvent::RouteDeviation {
                deviation_m: state.deviation_m,
                position,
                timestamp,
            });
        }

        if let Some((index, distance_m)) = state.next_instruction()
            && index >= state.next_to_announce
            && distance_m <= self.config.voice_alert_m
        {
            state.next_to_announce = index + 1;
            let step = &state.route.steps[index];
            events.push(TrackerEvent::InstructionAhead {
                index,
                distance_m,
                text: step.text.clone(),
                priority: step.maneuver.is_priority(),
            });
        }

        let snapshot = state.snapshot();
        debug!(
            "progress: {:.1}% ({:.0}m / {:.0}m), deviation {:.0}m",
            snapshot.percent, snapshot.traveled_m, snapshot.total_m, snapshot.deviation_m
        );

        if state.is_at_end(self.config.completion_epsilon) {
            info!("Route completed");
            events.push(TrackerEvent::RouteCompleted {
                traveled_m: state.traveled_m,
                timestamp,
            });
            if let Phase::Tracking(state) = std::mem::replace(&mut self.phase, Phase::Idle) {
                self.phase = Phase::Completed(state);
            }
        }

        for event in events {
            self.emit(event);
        }

        Ok(snapshot)
    }

    /// Ends the current session, if any, and forgets its breadcrumbs.
    pub fn stop(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            info!("Tracking stopped");
        }
        self.phase = Phase::Idle;
    }

    /// All zeroes when idle.
    pub fn snapshot(&self) -> ProgressSnapshot {
        match &self.phase {
            Phase::Idle => ProgressSnapshot::default(),
            Phase::Tracking(state) | Phase::Completed(state) => state.snapshot(),
        }
    }

    pub fn route(&self) -> Option<&Arc<Route>> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Tracking(state) | Phase::Completed(state) => Some(&state.route),
        }
    }

    /// Oldest first.
    pub fn breadcrumbs(&self) -> Vec<Location> {
        match &self.phase {
            Phase::Idle => Vec::new(),
            Phase::Tracking(state) | Phase::Completed(state) => {
                state.breadcrumbs.iter().copied().collect()
            }
        }
    }

    pub fn last_update(&self) -> Option<Timestamp> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Tracking(state) | Phase::Completed(state) => state.last_update,
        }
    }

    fn emit(&self, event: TrackerEvent) {
        if let Some(events) = &self.events
            && events.unbounded_send(event).is_err()
        {
            debug!("nobody is listening for tracker events");
        }
    }

    fn invalid_state(&self, expected: TrackerState) -> Error {
        Error::InvalidState {
            expected: expected.name(),
            found: self.state().name(),
        }
    }
}
