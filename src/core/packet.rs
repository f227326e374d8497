//! Packet view consumed by the app-layer dispatch core
//!
//! The capture and decode layers live upstream; this module only carries
//! what the dispatcher needs: the 5-tuple, the payload, and the flow
//! direction the packet is travelling in.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "tcp"),
            IpProtocol::Udp => write!(f, "udp"),
            IpProtocol::Icmp => write!(f, "icmp"),
            IpProtocol::Icmpv6 => write!(f, "icmpv6"),
            IpProtocol::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// Direction of data within a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the initiator to the responder
    ToServer,
    /// From the responder to the initiator
    ToClient,
}

impl Direction {
    /// The other direction
    pub fn opposite(self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }

    /// Index used wherever per-direction state is kept in a pair
    /// (ToServer = 0, ToClient = 1)
    pub fn index(self) -> usize {
        match self {
            Direction::ToServer => 0,
            Direction::ToClient => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToServer => write!(f, "toserver"),
            Direction::ToClient => write!(f, "toclient"),
        }
    }
}

/// Packet as seen by the app-layer dispatcher
#[derive(Debug, Clone)]
pub struct Packet {
    /// Source address
    pub src_ip: IpAddr,
    /// Destination address
    pub dst_ip: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Transport protocol
    pub proto: IpProtocol,
    /// Flow direction this packet travels in
    direction: Direction,
    /// Transport payload
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet view
    pub fn new(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: IpProtocol,
        direction: Direction,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
            direction,
            payload,
        }
    }

    /// Transport payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Direction the packet travels in
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Temporarily retag the packet's direction.
    ///
    /// The dispatcher flips the direction while it drives the opposing
    /// half-stream through a nested reassembly call. The original
    /// direction is restored when the guard drops, on every exit path.
    pub fn override_direction(&mut self, dir: Direction) -> DirectionOverride<'_> {
        let saved = self.direction;
        self.direction = dir;
        DirectionOverride { pkt: self, saved }
    }
}

/// Scoped direction retag; restores the saved direction on drop
pub struct DirectionOverride<'a> {
    pkt: &'a mut Packet,
    saved: Direction,
}

impl std::ops::Deref for DirectionOverride<'_> {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        self.pkt
    }
}

impl std::ops::DerefMut for DirectionOverride<'_> {
    fn deref_mut(&mut self) -> &mut Packet {
        self.pkt
    }
}

impl Drop for DirectionOverride<'_> {
    fn drop(&mut self) {
        self.pkt.direction = self.saved;
    }
}
