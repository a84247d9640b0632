use meshradio_core::{NetPacket, NodeId};

/// The interface shared by the network-side packet queues.
///
/// Queues sit between the packet source and the controller. Pops block until
/// a packet is eligible; `kick` wakes a blocked pop without producing a
/// value, and `stop` shuts the queue down permanently. A disabled (stopped)
/// queue still accepts pushes; they are drained if the queue is restarted
/// via `reset`.
pub trait NetQueue: Send + Sync {
    /// Enqueue a packet, routing it to the appropriate sub-queue
    fn push(&self, pkt: Box<NetPacket>);

    /// Enqueue a packet at high priority
    fn push_hi(&self, pkt: Box<NetPacket>);

    /// Re-enqueue a packet that has already been popped once, e.g. after a
    /// missed transmission slot
    fn repush(&self, pkt: Box<NetPacket>);

    /// Dequeue the next eligible packet, blocking while the queue is empty.
    /// Returns `None` if the queue was kicked or stopped, or if no enqueued
    /// packet is currently eligible.
    fn pop(&self) -> Option<Box<NetPacket>>;

    /// Wake a blocked pop without producing a packet
    fn kick(&self);

    /// Permanently stop the queue; blocked and future pops return `None`
    fn stop(&self);

    /// Re-enable a stopped queue, clearing its contents
    fn reset(&self);

    /// Open or close the send window toward a next hop. Packets toward a
    /// closed window are not eligible to pop.
    fn set_send_window_status(&self, node: NodeId, open: bool);

    /// Update the encoding rate toward a next hop, re-deriving sub-queue
    /// priorities
    fn update_mcs_rate(&self, node: NodeId, rate: f64);

    /// Set the expected transmission delay subtracted from latency deadlines
    fn set_transmission_delay(&self, delay: f64);

    fn transmission_delay(&self) -> f64;
}
