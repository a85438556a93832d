use async_trait::async_trait;
use etherparse::{Ipv4Ecn, Ipv4Header};
#[cfg(feature = "serde")]
use serde::Deserialize;
use std::{fmt::Debug, sync::Arc};
use tokio::time::Instant;
use tracing::trace;

use crate::error::Error;

pub mod dualpi2;

// Length of the Ethernet header preceding the network layer
const ETHERNET_HEADER_LEN: usize = 14;

/// ECN codepoint carried in the low two bits of the IPv4 TOS byte (RFC 3168).
/// ECT(1) doubles as the L4S identifier (RFC 9331).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnCodepoint {
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

impl EcnCodepoint {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => EcnCodepoint::Ect1,
            0b10 => EcnCodepoint::Ect0,
            0b11 => EcnCodepoint::Ce,
            _ => EcnCodepoint::NotEct,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            EcnCodepoint::NotEct => 0b00,
            EcnCodepoint::Ect1 => 0b01,
            EcnCodepoint::Ect0 => 0b10,
            EcnCodepoint::Ce => 0b11,
        }
    }

    /// True iff the codepoint selects the L4S service: ECT(1) or CE.
    pub fn is_l4s(self) -> bool {
        matches!(self, EcnCodepoint::Ect1 | EcnCodepoint::Ce)
    }

    /// True iff the sender declared ECN capability (any codepoint but Not-ECT).
    pub fn is_ect(self) -> bool {
        self != EcnCodepoint::NotEct
    }
}

pub trait Packet: Debug + 'static + Send {
    fn from_raw_buffer(buf: &[u8]) -> Self;

    // Raw buffer length
    fn length(&self) -> usize;
    // Network layer length
    fn l3_length(&self) -> usize;
    fn as_slice(&self) -> &[u8];
    fn ip_hdr(&self) -> Option<Ipv4Header>;

    // Timestamp, set when the packet enters the queueing system
    fn get_timestamp(&self) -> Instant;
    fn set_timestamp(&mut self, timestamp: Instant);

    fn ecn(&self) -> EcnCodepoint;
    // Rewrites the codepoint in place; a no-op for non-IPv4 buffers
    fn set_ecn(&mut self, ecn: EcnCodepoint);
}

#[derive(Clone, Debug)]
pub struct StdPacket {
    buf: Vec<u8>,
    timestamp: Instant,
}

impl Packet for StdPacket {
    fn from_raw_buffer(buf: &[u8]) -> Self {
        Self {
            buf: buf.to_vec(),
            timestamp: Instant::now(),
        }
    }

    fn length(&self) -> usize {
        self.buf.len()
    }

    fn l3_length(&self) -> usize {
        self.buf.len().saturating_sub(ETHERNET_HEADER_LEN)
    }

    fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    fn ip_hdr(&self) -> Option<Ipv4Header> {
        if let Ok(result) = etherparse::Ethernet2Header::from_slice(self.buf.as_slice()) {
            if let Ok(ip_hdr) = etherparse::Ipv4Header::from_slice(result.1) {
                return Some(ip_hdr.0);
            }
        }
        None
    }

    fn get_timestamp(&self) -> Instant {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: Instant) {
        self.timestamp = timestamp;
    }

    fn ecn(&self) -> EcnCodepoint {
        self.ip_hdr()
            .map_or(EcnCodepoint::NotEct, |ip_hdr| {
                EcnCodepoint::from_bits(ip_hdr.ecn.value())
            })
    }

    fn set_ecn(&mut self, ecn: EcnCodepoint) {
        let Some(mut ip_hdr) = self.ip_hdr() else {
            trace!("Ignore ECN rewrite on non-IPv4 packet");
            return;
        };
        let Ok(codepoint) = Ipv4Ecn::try_new(ecn.bits()) else {
            return;
        };
        ip_hdr.ecn = codepoint;
        ip_hdr.header_checksum = ip_hdr.calc_header_checksum();
        let header_end = ETHERNET_HEADER_LEN + ip_hdr.header_len();
        let mut target = &mut self.buf[ETHERNET_HEADER_LEN..header_end];
        if ip_hdr.write_raw(&mut target).is_err() {
            trace!("Failed to rewrite IPv4 header while setting ECN codepoint");
        }
    }
}

pub trait Ingress<P>: Send + Sync
where
    P: Packet,
{
    fn enqueue(&self, packet: P) -> Result<(), Error>;

    fn reset(&mut self) {}
}

#[async_trait]
pub trait Egress<P>: Send
where
    P: Packet,
{
    async fn dequeue(&mut self) -> Option<P>;

    fn reset(&mut self) {}

    /// 0 means drop, 1 means pass-through, 2 means normal operation
    fn change_state(&self, _state: i32) {}
}

pub trait ControlInterface: Send + Sync + 'static {
    #[cfg(feature = "serde")]
    type Config: for<'a> Deserialize<'a> + Send;
    #[cfg(not(feature = "serde"))]
    type Config: Send;
    fn set_config(&self, config: Self::Config) -> Result<(), Error>;
}

#[async_trait]
pub trait Cell<P>
where
    P: Packet,
{
    type IngressType: Ingress<P> + 'static;
    type EgressType: Egress<P> + 'static;
    type ControlInterfaceType: ControlInterface;

    fn sender(&self) -> Arc<Self::IngressType>;
    fn receiver(&mut self) -> &mut Self::EgressType;
    fn into_receiver(self) -> Self::EgressType;
    fn control_interface(&self) -> Arc<Self::ControlInterfaceType>;
}
