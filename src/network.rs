//! Network collaborator interface and IP reservations.
//!
//! A [`NetworkReservation`] is an IP claim against a named network. Static
//! reservations pin an externally fixed address; dynamic reservations are
//! assigned out of the network's pool. The `reserved` flag is only set by the
//! network itself during [`Network::reserve`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// How a reservation's address is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservationKind {
    /// Externally fixed address.
    Static,
    /// Assigned from the network's pool.
    #[default]
    Dynamic,
}

/// An IP claim on one network. Unique per IP within its network.
#[derive(Debug, Clone)]
pub struct NetworkReservation {
    pub network: String,
    pub ip: Option<String>,
    pub kind: ReservationKind,
    pub reserved: bool,
}

impl NetworkReservation {
    /// A dynamic reservation with no address yet.
    pub fn dynamic(network: &str) -> Self {
        Self {
            network: network.to_string(),
            ip: None,
            kind: ReservationKind::Dynamic,
            reserved: false,
        }
    }

    /// A static reservation for a fixed address.
    pub fn fixed(network: &str, ip: &str) -> Self {
        Self {
            network: network.to_string(),
            ip: Some(ip.to_string()),
            kind: ReservationKind::Static,
            reserved: false,
        }
    }

    /// A reservation reconstructed from an agent-reported address. The
    /// network decides its kind when it is re-reserved.
    pub fn from_state(network: &str, ip: Option<String>) -> Self {
        Self {
            network: network.to_string(),
            ip,
            kind: ReservationKind::Dynamic,
            reserved: false,
        }
    }

    pub fn is_static(&self) -> bool {
        self.kind == ReservationKind::Static
    }
}

/// One named network in the deployment.
///
/// `reserve` classifies the reservation and sets its `reserved` flag; it
/// returns `Ok` even when the network is exhausted (the flag stays false), so
/// callers decide whether an unfulfilled claim is fatal. Transport failures
/// are errors.
#[async_trait]
pub trait Network: Send + Sync {
    fn name(&self) -> &str;

    async fn reserve(&self, reservation: &mut NetworkReservation) -> Result<()>;

    async fn release(&self, reservation: &NetworkReservation);

    /// Serializable settings handed to an agent using this reservation.
    fn network_settings(&self, reservation: &NetworkReservation) -> Value;
}
