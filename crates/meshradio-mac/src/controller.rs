use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use meshradio_core::{MonoClock, NetPacket, RadioPacket, Seq};
use meshradio_net::element::{PacketSource, RadioOut};
use meshradio_net::queue::NetQueue;
use meshradio_phy::slot::ModPacket;

/// The MAC controller seam.
///
/// The controller sits between the network queue and the PHY pipeline: it
/// hands packets to the synthesizer, accepts ordered demodulated packets,
/// and is notified of missed slots and completed transmissions. ARQ and
/// adaptive-MCS controllers implement this trait; [PassthroughController]
/// is the stock implementation.
pub trait Controller: Send + Sync {
    /// Pull the next packet to be sent over the radio
    fn pull(&self) -> Option<Box<NetPacket>>;

    /// Wake a blocked pull
    fn kick(&self);

    /// Process an ordered demodulated packet
    fn received(&self, pkt: Box<RadioPacket>);

    /// A packet missed its transmission slot; it goes back to the head of
    /// the queue
    fn missed(&self, pkt: Box<NetPacket>);

    /// Notification that a slot's packets went over the air
    fn transmitted(&self, mpkts: &mut [ModPacket]);
}

/// A controller with no ARQ: sequence numbers are stamped on the way out,
/// received packets flow straight to the network side.
pub struct PassthroughController {
    netq: Arc<dyn NetQueue>,
    seq: AtomicU16,

    /// Output port for received packets
    pub radio_out: RadioOut,
}

impl PassthroughController {
    pub fn new(netq: Arc<dyn NetQueue>) -> Self {
        Self {
            netq,
            seq: AtomicU16::new(0),
            radio_out: RadioOut::new(),
        }
    }
}

impl Controller for PassthroughController {
    fn pull(&self) -> Option<Box<NetPacket>> {
        let mut pkt = self.netq.pop()?;

        // Stamp the sequence number unless the packet already carries one
        // (e.g. it came back after a missed slot)
        if !pkt.hdr.flags.has_seq {
            pkt.hdr.seq = Seq(self.seq.fetch_add(1, Ordering::Relaxed));
            pkt.hdr.flags.has_seq = true;
            pkt.internal_flags.has_seq = true;
        }

        let now = MonoClock::now();

        pkt.timestamps.dequeue_start = Some(now);
        pkt.timestamps.dequeue_end = Some(MonoClock::now());

        Some(pkt)
    }

    fn kick(&self) {
        self.netq.kick();
    }

    fn received(&self, pkt: Box<RadioPacket>) {
        // The controller decides what happens to flagged packets; without
        // ARQ a corrupt payload is of no use to anyone
        if pkt.internal_flags.invalid_payload {
            tracing::debug!("dropping packet with invalid payload: seq={}", pkt.hdr.seq);
            return;
        }

        self.radio_out.push(pkt);
    }

    fn missed(&self, pkt: Box<NetPacket>) {
        tracing::warn!("packet missed its slot: seq={}", pkt.hdr.seq);
        self.netq.repush(pkt);
    }

    fn transmitted(&self, _mpkts: &mut [ModPacket]) {}
}

/// Adapter: the synthesizer pulls its packets from the controller
impl PacketSource<Box<NetPacket>> for PassthroughController {
    fn recv(&self) -> Option<Box<NetPacket>> {
        self.pull()
    }

    fn kick(&self) {
        Controller::kick(self)
    }
}
