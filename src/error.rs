use std::fmt::{self, Display};

use crate::model::{Endpoint, ZoneId};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// An endpoint lies inside a blocked zone, so the provider wasn't asked.
    EndpointBlocked { which: Endpoint, zone_id: ZoneId },
    /// Every candidate route passes through a blocked zone (or there were
    /// none at all).
    NoValidRoute,
    /// Fewer than two candidates avoid the blocked zones.
    NoAlternative,
    ProviderUnavailable(String),
    ProviderTimeout,
    DuplicateZoneId(ZoneId),
    ZoneNotFound(ZoneId),
    /// The progress tracker was used from the wrong state.
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    /// A cache entry failed to decode. Only ever logged; readers see a miss.
    CacheCorrupt(String),
    /// A newer request was started while this one was in flight, so its
    /// result was thrown away.
    Superseded,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EndpointBlocked { which, zone_id } => {
                write!(f, "{which} is inside blocked zone {zone_id}")
            }
            Error::NoValidRoute => write!(f, "all routes pass through blocked zones"),
            Error::NoAlternative => write!(f, "no alternative routes available"),
            Error::ProviderUnavailable(reason) => {
                write!(f, "routing provider unavailable: {reason}")
            }
            Error::ProviderTimeout => write!(f, "routing provider timed out"),
            Error::DuplicateZoneId(id) => write!(f, "duplicate zone id: {id}"),
            Error::ZoneNotFound(id) => write!(f, "zone not found: {id}"),
            Error::InvalidState { expected, found } => {
                write!(f, "invalid state: expected {expected}, found {found}")
            }
            Error::CacheCorrupt(reason) => write!(f, "corrupt cache entry: {reason}"),
            Error::Superseded => write!(f, "request was superseded by a newer one"),
        }
    }
}

impl std::error::Error for Error {}

/// What a [`crate::provider::RoutingProvider`] can fail with.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Unavailable(String),
    Timeout,
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unavailable(reason) => write!(f, "unavailable: {reason}"),
            ProviderError::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(reason) => Error::ProviderUnavailable(reason),
            ProviderError::Timeout => Error::ProviderTimeout,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}
