//! Local Medium
//!
//! In-process stand-in for the radio layer. Sessions attach as stations,
//! advertise and scan under a service id, and exchange encoded frames.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::endpoint::EndpointId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediumError {
    #[error("station {0} is not attached to the medium")]
    NotAttached(EndpointId),
    #[error("endpoint {0} is unreachable")]
    Unreachable(EndpointId),
    #[error("station is already advertising")]
    AlreadyAdvertising,
    #[error("station is already discovering")]
    AlreadyDiscovering,
    #[error("service id must not be empty")]
    EmptyServiceId,
}

/// Everything the medium hands to a station
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An advertiser of the scanned service appeared
    Found {
        endpoint_id: EndpointId,
        name: String,
        service_id: String,
    },
    /// An advertiser of the scanned service went away
    Lost { endpoint_id: EndpointId },
    /// Encoded frame from another station
    Frame { from: EndpointId, data: Bytes },
    /// The link to a station is gone (it detached)
    LinkDown { endpoint_id: EndpointId },
}

#[derive(Debug, Clone)]
struct Advertisement {
    service_id: String,
    name: String,
}

struct Station {
    tx: mpsc::UnboundedSender<Delivery>,
    advertisement: Option<Advertisement>,
    scanning: Option<String>,
}

/// Shared in-process medium; clones refer to the same medium.
#[derive(Clone, Default)]
pub struct LocalMedium {
    stations: Arc<Mutex<HashMap<EndpointId, Station>>>,
}

impl LocalMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new station and return its id and delivery queue
    pub fn attach(&self) -> (EndpointId, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stations = self.lock();
        let id = loop {
            let candidate = EndpointId::random();
            if !stations.contains_key(&candidate) {
                break candidate;
            }
        };
        stations.insert(
            id.clone(),
            Station {
                tx,
                advertisement: None,
                scanning: None,
            },
        );
        tracing::debug!("Station {} attached", id);
        (id, rx)
    }

    /// Withdraw a station: scanners see it lost, every other station sees the link drop
    pub fn detach(&self, station: &EndpointId) {
        let mut stations = self.lock();
        let Some(removed) = stations.remove(station) else {
            return;
        };
        if let Some(ad) = removed.advertisement {
            notify_scanners(&stations, station, &ad.service_id, |id| Delivery::Lost {
                endpoint_id: id.clone(),
            });
        }
        for other in stations.values() {
            let _ = other.tx.send(Delivery::LinkDown {
                endpoint_id: station.clone(),
            });
        }
        tracing::debug!("Station {} detached", station);
    }

    pub fn advertise(
        &self,
        station: &EndpointId,
        service_id: &str,
        name: &str,
    ) -> Result<(), MediumError> {
        if service_id.is_empty() {
            return Err(MediumError::EmptyServiceId);
        }
        let mut stations = self.lock();
        let entry = stations
            .get_mut(station)
            .ok_or_else(|| MediumError::NotAttached(station.clone()))?;
        if entry.advertisement.is_some() {
            return Err(MediumError::AlreadyAdvertising);
        }
        entry.advertisement = Some(Advertisement {
            service_id: service_id.to_string(),
            name: name.to_string(),
        });

        notify_scanners(&stations, station, service_id, |id| Delivery::Found {
            endpoint_id: id.clone(),
            name: name.to_string(),
            service_id: service_id.to_string(),
        });
        Ok(())
    }

    /// Returns whether the station was advertising
    pub fn stop_advertising(&self, station: &EndpointId) -> bool {
        let mut stations = self.lock();
        let Some(ad) = stations
            .get_mut(station)
            .and_then(|s| s.advertisement.take())
        else {
            return false;
        };
        notify_scanners(&stations, station, &ad.service_id, |id| Delivery::Lost {
            endpoint_id: id.clone(),
        });
        true
    }

    pub fn discover(&self, station: &EndpointId, service_id: &str) -> Result<(), MediumError> {
        if service_id.is_empty() {
            return Err(MediumError::EmptyServiceId);
        }
        let mut stations = self.lock();
        let entry = stations
            .get_mut(station)
            .ok_or_else(|| MediumError::NotAttached(station.clone()))?;
        if entry.scanning.is_some() {
            return Err(MediumError::AlreadyDiscovering);
        }
        entry.scanning = Some(service_id.to_string());
        let tx = entry.tx.clone();

        for (id, other) in stations.iter() {
            if id == station {
                continue;
            }
            if let Some(ad) = other.advertisement.as_ref() {
                if ad.service_id == service_id {
                    let _ = tx.send(Delivery::Found {
                        endpoint_id: id.clone(),
                        name: ad.name.clone(),
                        service_id: service_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns whether the station was discovering
    pub fn stop_discovery(&self, station: &EndpointId) -> bool {
        self.lock()
            .get_mut(station)
            .and_then(|s| s.scanning.take())
            .is_some()
    }

    /// Deliver an encoded frame from one station to another
    pub fn send(&self, from: &EndpointId, to: &EndpointId, data: Bytes) -> Result<(), MediumError> {
        let stations = self.lock();
        if !stations.contains_key(from) {
            return Err(MediumError::NotAttached(from.clone()));
        }
        let target = stations
            .get(to)
            .ok_or_else(|| MediumError::Unreachable(to.clone()))?;
        target
            .tx
            .send(Delivery::Frame {
                from: from.clone(),
                data,
            })
            .map_err(|_| MediumError::Unreachable(to.clone()))
    }

    /// Current advertisers of a service
    pub fn advertisers(&self, service_id: &str) -> Vec<(EndpointId, String)> {
        self.lock()
            .iter()
            .filter_map(|(id, s)| {
                s.advertisement
                    .as_ref()
                    .filter(|ad| ad.service_id == service_id)
                    .map(|ad| (id.clone(), ad.name.clone()))
            })
            .collect()
    }

    pub fn is_attached(&self, station: &EndpointId) -> bool {
        self.lock().contains_key(station)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointId, Station>> {
        self.stations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn notify_scanners<F>(
    stations: &HashMap<EndpointId, Station>,
    source: &EndpointId,
    service_id: &str,
    make: F,
) where
    F: Fn(&EndpointId) -> Delivery,
{
    for (id, other) in stations.iter() {
        if id != source && other.scanning.as_deref() == Some(service_id) {
            let _ = other.tx.send(make(source));
        }
    }
}
