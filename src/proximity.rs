//! Proximity-derived enter/exit events.
//!
//! Feeds accepted fixes against the known places and emits boundary events
//! with [`EventSource::Proximity`]. Entry requires the fix to be inside a
//! place's radius. Exit requires it to be beyond `radius * exit_factor`, so
//! jitter near the boundary does not produce enter/exit churn.
//!
//! The visit tracker has the final say: callers [`sync`](ProximityDetector::sync)
//! the detector with the tracker's current place before each observation, so
//! visits closed or opened elsewhere (sweep, geofence, deletion) are picked up.

use crate::visits::{BoundaryEvent, EventSource, PlatformEvent};
use crate::{Fix, Place, PlaceId};

#[derive(Debug, Clone)]
pub struct ProximityDetector {
    exit_factor: f64,
    inside: Option<PlaceId>,
}

impl ProximityDetector {
    pub fn new(exit_factor: f64) -> Self {
        Self {
            exit_factor: exit_factor.max(1.0),
            inside: None,
        }
    }

    /// Place the detector currently considers the fix to be inside.
    pub fn inside(&self) -> Option<PlaceId> {
        self.inside
    }

    /// Forget a place, e.g. after it was deleted.
    pub fn forget(&mut self, place_id: PlaceId) {
        if self.inside == Some(place_id) {
            self.inside = None;
        }
    }

    /// Align with the place the visit tracker considers active.
    pub fn sync(&mut self, current_place: Option<PlaceId>) {
        if self.inside != current_place {
            log::debug!(
                "[Proximity] Resync from {:?} to tracker place {:?}",
                self.inside,
                current_place
            );
            self.inside = current_place;
        }
    }

    /// Observe an accepted fix and return the boundary events it implies.
    pub fn observe(&mut self, fix: &Fix, places: &[Place]) -> Vec<PlatformEvent> {
        let point = fix.point();
        let mut events = Vec::new();

        if let Some(id) = self.inside {
            match places.iter().find(|p| p.id == id) {
                Some(place) if place.distance_to(&point) <= place.radius_m * self.exit_factor => {
                    return events;
                }
                Some(_) => {
                    log::debug!("[Proximity] Left place {} at {}", id, fix.timestamp);
                    events.push(PlatformEvent::Exit(BoundaryEvent::new(
                        id,
                        fix.timestamp,
                        EventSource::Proximity,
                    )));
                }
                None => {}
            }
            self.inside = None;
        }

        let nearest = places
            .iter()
            .map(|p| (p, p.distance_to(&point)))
            .filter(|(p, d)| *d <= p.radius_m)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((place, _)) = nearest {
            log::debug!("[Proximity] Entered place {} at {}", place.id, fix.timestamp);
            self.inside = Some(place.id);
            events.push(PlatformEvent::Enter(BoundaryEvent::new(
                place.id,
                fix.timestamp,
                EventSource::Proximity,
            )));
        }

        events
    }
}
