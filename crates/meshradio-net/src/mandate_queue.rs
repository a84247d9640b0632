use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use meshradio_core::logger::{Logger, PacketFields, SendRecord};
use meshradio_core::{FlowUid, MonoClock, MonoTime, NetPacket, NodeId, WallClock};

use crate::element::PacketSource;
use crate::queue::NetQueue;
use crate::timer_queue::TimerQueue;

/// Factor specifying maximum tokens in a token bucket relative to the
/// throughput requirement.
pub const MAX_TOKEN_FACTOR: f64 = 2.0;

/// Factor specifying tokens added to a token bucket relative to the
/// throughput requirement.
pub const TOKEN_FACTOR: f64 = 1.1;

/// A queue priority.
///
/// The first number is the priority of the category a queue belongs to, the
/// second the relative priority within the category. The second number
/// reflects the value of a flow.
pub type Priority = (i32, f64);

/// Priority for the high-priority queue
pub const HI_QUEUE_PRIORITY: Priority = (100, 0.0);

/// Default priority for per-flow queues
pub const DEFAULT_FLOW_QUEUE_PRIORITY: Priority = (1, 0.0);

/// Priority for the default queue
pub const DEFAULT_QUEUE_PRIORITY: Priority = (0, 0.0);

fn cmp_priority(a: Priority, b: Priority) -> std::cmp::Ordering {
    a.0.cmp(&b.0)
        .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueType {
    Fifo,
    Lifo,
}

/// A per-flow service-level objective
#[derive(Clone, Debug, Default)]
pub struct Mandate {
    pub flow_uid: FlowUid,
    /// Minimum throughput (bits per second)
    pub min_throughput_bps: Option<f64>,
    /// Maximum latency (seconds); becomes a packet deadline at enqueue
    pub max_latency_s: Option<f64>,
    /// Scoring weight of the flow
    pub point_value: f64,
    /// A file transfer's throughput requirement is recomputed from its
    /// deadline and backlog rather than taken as given
    pub is_file_transfer: bool,
}

impl Mandate {
    pub fn is_throughput(&self) -> bool {
        self.min_throughput_bps.is_some() && !self.is_file_transfer
    }
}

struct TokenBucket {
    /// Last time the bucket was filled
    last_fill: MonoTime,
    /// Tokens (bytes) in the bucket
    tokens: f64,
    /// Maximum number of tokens allowed in the bucket
    max_tokens: f64,
}

struct SubQueue {
    priority: Priority,
    qtype: QueueType,
    active: bool,
    mandate: Option<Mandate>,
    nexthop: Option<NodeId>,
    /// Encoding rate toward the next hop
    rate: Option<f64>,
    /// Minimum throughput (bytes per second)
    min_throughput: Option<f64>,
    bucket: Option<TokenBucket>,
    /// Bytes in the queue
    nbytes: usize,
    q: VecDeque<Box<NetPacket>>,
}

impl SubQueue {
    fn new(priority: Priority, qtype: QueueType) -> Self {
        Self {
            priority,
            qtype,
            active: false,
            mandate: None,
            nexthop: None,
            rate: None,
            min_throughput: None,
            bucket: None,
            nbytes: 0,
            q: VecDeque::new(),
        }
    }

    /// May a packet be sent from this queue right now?
    fn should_send(&self, bonus: bool) -> bool {
        if bonus {
            return true;
        }

        match &self.bucket {
            Some(bucket) => bucket.tokens > 0.0,
            None => true,
        }
    }
}

/// Index of the high-priority queue in the sub-queue table
const HIQ: usize = 0;
/// Index of the default queue in the sub-queue table
const DEFAULTQ: usize = 1;

struct State {
    done: bool,
    bonus_phase: bool,
    transmission_delay: f64,
    subqs: Vec<SubQueue>,
    /// Sub-queue indices in descending priority order
    order: Vec<usize>,
    flow_qs: HashMap<FlowUid, usize>,
    node_rates: HashMap<NodeId, f64>,
    send_windows: HashMap<NodeId, bool>,
    /// Packets in *active* sub-queues
    nitems: usize,
    need_sort: bool,
    /// Position of the next queue to serve during bonus time
    bonus_idx: usize,
    /// Refill timers to schedule once the lock is released: (subq, delay)
    refill: Vec<(usize, f64)>,
}

impl State {
    fn new(bonus_phase: bool) -> Self {
        let mut state = Self {
            done: false,
            bonus_phase,
            transmission_delay: 0.0,
            subqs: vec![
                SubQueue::new(HI_QUEUE_PRIORITY, QueueType::Fifo),
                SubQueue::new(DEFAULT_QUEUE_PRIORITY, QueueType::Fifo),
            ],
            order: Vec::new(),
            flow_qs: HashMap::new(),
            node_rates: HashMap::new(),
            send_windows: HashMap::new(),
            nitems: 0,
            need_sort: false,
            bonus_idx: 0,
            refill: Vec::new(),
        };

        state.add_queue(HIQ);
        state.add_queue(DEFAULTQ);
        state
    }

    /// Insert a sub-queue into the priority order, keeping it sorted
    fn add_queue(&mut self, idx: usize) {
        let priority = self.subqs[idx].priority;
        let pos = self
            .order
            .partition_point(|&j| cmp_priority(self.subqs[j].priority, priority).is_ge());

        self.order.insert(pos, idx);
    }

    /// Stable sort in order of descending priority, so the highest-priority
    /// queue is first. Stability prevents churn among queues of equal
    /// priority.
    fn sort_queues(&mut self) {
        let subqs = &self.subqs;

        self.order
            .sort_by(|&a, &b| cmp_priority(subqs[b].priority, subqs[a].priority));
        self.need_sort = false;
    }

    /// The sub-queue a packet belongs in, creating a flow queue on demand
    fn queue_for(&mut self, pkt: &NetPacket) -> usize {
        match pkt.flow_uid {
            Some(flow_uid) => match self.flow_qs.get(&flow_uid) {
                Some(&idx) => idx,
                None => {
                    let idx = self.subqs.len();

                    self.subqs
                        .push(SubQueue::new(DEFAULT_FLOW_QUEUE_PRIORITY, QueueType::Fifo));
                    self.flow_qs.insert(flow_uid, idx);
                    self.add_queue(idx);
                    idx
                }
            },
            None => DEFAULTQ,
        }
    }

    fn activate(&mut self, idx: usize) {
        if !self.subqs[idx].active {
            if let Some(nexthop) = self.subqs[idx].nexthop {
                if let Some(&rate) = self.node_rates.get(&nexthop) {
                    self.update_rate(idx, rate);
                }
            }

            self.nitems += self.subqs[idx].q.len();
            self.subqs[idx].active = true;
        }
    }

    fn deactivate(&mut self, idx: usize) {
        if self.subqs[idx].active {
            self.nitems -= self.subqs[idx].q.len();
            self.subqs[idx].active = false;
        }
    }

    fn update_rate(&mut self, idx: usize, rate: f64) {
        self.subqs[idx].rate = Some(rate);
        self.update_priority(idx);
    }

    /// Re-derive the value component of a mandated queue's priority
    fn update_priority(&mut self, idx: usize) {
        let subq = &mut self.subqs[idx];

        if let (Some(rate), Some(min_throughput), Some(mandate)) =
            (subq.rate, subq.min_throughput, subq.mandate.as_ref())
        {
            let new_priority = rate * mandate.point_value / min_throughput;

            if subq.priority.1 != new_priority {
                subq.priority.1 = new_priority;
                self.need_sort = true;
            }
        }
    }

    fn set_mandate(&mut self, idx: usize, mandate: Mandate) {
        if let Some(bps) = mandate.min_throughput_bps {
            let min_throughput = bps / 8.0;

            self.subqs[idx].min_throughput = Some(min_throughput);
            self.subqs[idx].bucket = Some(TokenBucket {
                last_fill: MonoClock::now(),
                tokens: TOKEN_FACTOR * min_throughput,
                max_tokens: MAX_TOKEN_FACTOR * min_throughput,
            });
        }

        self.subqs[idx].mandate = Some(mandate);
        self.update_priority(idx);
    }

    /// Add tokens accrued since the bucket was last filled
    fn fill_bucket(&mut self, idx: usize, now: MonoTime) {
        let subq = &mut self.subqs[idx];

        let (Some(bucket), Some(min_throughput)) = (subq.bucket.as_mut(), subq.min_throughput)
        else {
            return;
        };

        let time_delta = now - bucket.last_fill;

        bucket.last_fill = now;
        bucket.tokens += TOKEN_FACTOR * time_delta * min_throughput;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);

        // Activate this flow if it has queued packets and tokens available.
        // Otherwise, set the fill bucket timer.
        if !subq.q.is_empty() && bucket.tokens > 0.0 {
            self.activate(idx);
        } else {
            self.set_fill_bucket_timer(idx);
        }
    }

    /// Request a timer to fire when the queue will have enough tokens to
    /// send a packet
    fn set_fill_bucket_timer(&mut self, idx: usize) {
        let subq = &self.subqs[idx];

        if let (Some(bucket), Some(min_throughput)) = (subq.bucket.as_ref(), subq.min_throughput) {
            if bucket.tokens <= 0.0 && min_throughput > 0.0 {
                self.refill.push((idx, (1.0 - bucket.tokens) / min_throughput));
            }
        }
    }

    /// Is the send window toward the packet's next hop open?
    fn can_pop(&self, pkt: &NetPacket) -> bool {
        self.send_windows.get(&pkt.hdr.nexthop).copied().unwrap_or(true)
    }

    /// Pop one packet from sub-queue `idx`, dropping expired packets along
    /// the way
    fn subq_pop(&mut self, idx: usize, now: MonoTime, bonus: bool) -> Option<Box<NetPacket>> {
        if !bonus {
            self.fill_bucket(idx, now);
        }

        if !self.subqs[idx].should_send(bonus) {
            self.set_fill_bucket_timer(idx);
            return None;
        }

        let positions: Vec<usize> = match self.subqs[idx].qtype {
            QueueType::Fifo => (0..self.subqs[idx].q.len()).collect(),
            QueueType::Lifo => (0..self.subqs[idx].q.len()).rev().collect(),
        };

        let mut removed = 0usize;
        let mut found = None;

        for pos in positions {
            // Account for packets already removed ahead of this position;
            // LIFO scans from the back, so earlier removals don't shift it
            let pos = match self.subqs[idx].qtype {
                QueueType::Fifo => pos - removed,
                QueueType::Lifo => pos,
            };

            if self.subqs[idx].q[pos].should_drop(now) {
                let pkt = self.subqs[idx].q.remove(pos).unwrap();

                self.erase_accounting(idx, &pkt);
                log_queue_drop(&pkt);
                removed += 1;
            } else if self.can_pop(&self.subqs[idx].q[pos]) {
                let pkt = self.subqs[idx].q.remove(pos).unwrap();

                self.erase_accounting(idx, &pkt);
                found = Some(pkt);
                break;
            }
        }

        match found {
            Some(pkt) => {
                if let Some(bucket) = self.subqs[idx].bucket.as_mut() {
                    bucket.tokens -= pkt.payload_size as f64;

                    // Outside the bonus phase a pop never leaves a mandated
                    // queue in debt; bonus traffic is billed against future
                    // budget.
                    if !bonus {
                        bucket.tokens = bucket.tokens.max(0.0);
                    }
                }

                Some(pkt)
            }
            None => {
                self.set_fill_bucket_timer(idx);
                None
            }
        }
    }

    fn erase_accounting(&mut self, idx: usize, pkt: &NetPacket) {
        if self.subqs[idx].active {
            self.nitems -= 1;
        }
        self.subqs[idx].nbytes -= pkt.payload_size.min(self.subqs[idx].nbytes);
    }

    fn pre_emplace(&mut self, idx: usize, pkt: &mut NetPacket) {
        if let Some(mandate) = self.subqs[idx].mandate.clone() {
            // Track the next hop so node rate information can update the
            // queue's priority
            self.subqs[idx].nexthop = Some(pkt.hdr.nexthop);

            // Add a deadline based on the mandate
            if let Some(max_latency) = mandate.max_latency_s {
                let base = pkt
                    .wall_timestamp
                    .map(WallClock::to_mono_time)
                    .unwrap_or(pkt.timestamp);

                pkt.deadline = Some(base + max_latency - self.transmission_delay);
            }
        }

        // If the queue is inactive, activate it if either the queue is empty
        // or this packet could be sent. An empty inactive queue has no bucket
        // fill timer running, so it must be activated for its bucket to be
        // serviced.
        if !self.subqs[idx].active
            && (self.subqs[idx].q.is_empty() || self.subqs[idx].should_send(self.bonus_phase))
        {
            self.activate(idx);
        }

        if self.subqs[idx].active {
            self.nitems += 1;
        }
        self.subqs[idx].nbytes += pkt.payload_size;
    }

    /// After any push to a file-transfer queue, re-derive its required
    /// throughput from the backlog and the front packet's deadline
    fn update_file_transfer_throughput(&mut self, idx: usize) {
        let is_file_transfer = self.subqs[idx]
            .mandate
            .as_ref()
            .is_some_and(|m| m.is_file_transfer);

        if !is_file_transfer {
            return;
        }

        let now = MonoClock::now();

        // Purge any packets that should be dropped
        let mut pos = 0;
        while pos < self.subqs[idx].q.len() {
            if self.subqs[idx].q[pos].should_drop(now) {
                let pkt = self.subqs[idx].q.remove(pos).unwrap();

                self.erase_accounting(idx, &pkt);
                log_queue_drop(&pkt);
            } else {
                pos += 1;
            }
        }

        if self.subqs[idx].nbytes == 0 {
            return;
        }

        let deadline = self.subqs[idx].q.front().and_then(|pkt| pkt.deadline);

        if let Some(deadline) = deadline {
            if deadline > now {
                let delta = deadline - now;
                let tokens = self.subqs[idx].bucket.as_ref().map_or(0.0, |b| b.tokens);
                let new_min = (self.subqs[idx].nbytes as f64 - tokens) / delta;

                self.set_file_transfer_throughput(idx, new_min.max(0.0));
            }
        }
    }

    fn set_file_transfer_throughput(&mut self, idx: usize, new_min_throughput: f64) {
        self.subqs[idx].min_throughput = Some(new_min_throughput);

        match self.subqs[idx].bucket.as_mut() {
            None => {
                self.subqs[idx].bucket = Some(TokenBucket {
                    last_fill: MonoClock::now(),
                    tokens: TOKEN_FACTOR * new_min_throughput,
                    max_tokens: MAX_TOKEN_FACTOR * new_min_throughput,
                });
            }
            Some(bucket) => {
                bucket.max_tokens = MAX_TOKEN_FACTOR * new_min_throughput;
                bucket.tokens = bucket.tokens.min(bucket.max_tokens);
            }
        }

        self.update_priority(idx);

        let has_tokens = self.subqs[idx]
            .bucket
            .as_ref()
            .is_some_and(|b| b.tokens > 0.0);

        if !self.subqs[idx].q.is_empty() && has_tokens {
            self.activate(idx);
        } else {
            self.set_fill_bucket_timer(idx);
        }
    }
}

fn log_queue_drop(pkt: &NetPacket) {
    tracing::debug!(
        "queue drop: seq={} nexthop={} deadline passed",
        pkt.hdr.seq,
        pkt.hdr.nexthop
    );

    if let Some(logger) = Logger::global() {
        logger.log_send(SendRecord {
            timestamp: pkt.timestamp.secs(),
            tx_timestamp: 0.0,
            mcsidx: pkt.mcsidx as u32,
            nretrans: pkt.nretrans,
            nsamples: 0,
            dropped: true,
            pkt: PacketFields::new(&pkt.hdr, &pkt.ehdr(), pkt.size()),
        });
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    kicked: AtomicBool,
    timer: TimerQueue,
}

/// A queue that obeys mandates.
///
/// Packets are routed to per-flow sub-queues served in descending priority
/// order, gated by per-flow token buckets derived from throughput mandates.
/// When no mandated queue can produce a packet and the bonus phase is
/// enabled, remaining traffic is served round-robin.
#[derive(Clone)]
pub struct MandateQueue {
    shared: Arc<Shared>,
}

impl MandateQueue {
    pub fn new(bonus_phase: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new(bonus_phase)),
                cond: Condvar::new(),
                kicked: AtomicBool::new(false),
                timer: TimerQueue::start(),
            }),
        }
    }

    pub fn bonus_phase(&self) -> bool {
        self.shared.state.lock().unwrap().bonus_phase
    }

    pub fn set_bonus_phase(&self, bonus_phase: bool) {
        self.shared.state.lock().unwrap().bonus_phase = bonus_phase;
    }

    pub fn set_flow_queue_type(&self, flow_uid: FlowUid, qtype: QueueType) {
        let mut state = self.shared.state.lock().unwrap();
        let idx = self.flow_queue(&mut state, flow_uid);

        state.subqs[idx].qtype = qtype;
    }

    pub fn set_flow_queue_priority(&self, flow_uid: FlowUid, priority: Priority) {
        let mut state = self.shared.state.lock().unwrap();
        let idx = self.flow_queue(&mut state, flow_uid);

        state.subqs[idx].priority = priority;
        state.need_sort = true;
    }

    /// Install the full mandate set. Packets that arrived in the default
    /// queue before their mandate was specified are re-routed to the proper
    /// flow queue.
    pub fn set_mandates(&self, mandates: HashMap<FlowUid, Mandate>) {
        let mut state = self.shared.state.lock().unwrap();

        for (flow_uid, mandate) in &mandates {
            let idx = self.flow_queue(&mut state, *flow_uid);

            state.subqs[idx].qtype = QueueType::Fifo;
            state.set_mandate(idx, mandate.clone());
        }

        // Re-route packets that were enqueued before their mandate arrived
        let mut pos = 0;
        while pos < state.subqs[DEFAULTQ].q.len() {
            let flow_uid = state.subqs[DEFAULTQ].q[pos].flow_uid;

            match flow_uid.filter(|uid| mandates.contains_key(uid)) {
                Some(uid) => {
                    let mut pkt = state.subqs[DEFAULTQ].q.remove(pos).unwrap();

                    state.erase_accounting(DEFAULTQ, &pkt);

                    let idx = state.flow_qs[&uid];
                    state.pre_emplace(idx, &mut pkt);
                    state.subqs[idx].q.push_back(pkt);
                    state.update_file_transfer_throughput(idx);
                }
                None => pos += 1,
            }
        }

        drop(state);
        self.flush_timers();
    }

    /// Current (flow, priority, rate, point value, min throughput) tuples in
    /// service order
    pub fn queue_priorities(&self) -> Vec<(Option<FlowUid>, Priority, Option<f64>, Option<f64>)> {
        let state = self.shared.state.lock().unwrap();

        state
            .order
            .iter()
            .map(|&idx| {
                let subq = &state.subqs[idx];
                let flow_uid = state
                    .flow_qs
                    .iter()
                    .find(|(_, &j)| j == idx)
                    .map(|(&uid, _)| uid);

                (flow_uid, subq.priority, subq.rate, subq.min_throughput)
            })
            .collect()
    }

    fn flow_queue(&self, state: &mut State, flow_uid: FlowUid) -> usize {
        match state.flow_qs.get(&flow_uid) {
            Some(&idx) => idx,
            None => {
                let idx = state.subqs.len();

                state
                    .subqs
                    .push(SubQueue::new(DEFAULT_FLOW_QUEUE_PRIORITY, QueueType::Fifo));
                state.flow_qs.insert(flow_uid, idx);
                state.add_queue(idx);
                idx
            }
        }
    }

    /// Schedule the refill timers requested while the state lock was held
    fn flush_timers(&self) {
        let refill: Vec<(usize, f64)> = {
            let mut state = self.shared.state.lock().unwrap();
            std::mem::take(&mut state.refill)
        };

        for (idx, delay) in refill {
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);

            self.shared.timer.run_in(delay, move || {
                if let Some(shared) = weak.upgrade() {
                    let was_active = {
                        let mut state = shared.state.lock().unwrap();

                        state.fill_bucket(idx, MonoClock::now());
                        state.subqs[idx].active
                    };

                    if was_active {
                        shared.cond.notify_one();
                    }

                    // The refill may itself have requested another timer
                    MandateQueue { shared: shared.clone() }.flush_timers();
                }
            });
        }
    }
}

impl NetQueue for MandateQueue {
    fn push(&self, mut pkt: Box<NetPacket>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let idx = state.queue_for(&pkt);

            state.pre_emplace(idx, &mut pkt);
            state.subqs[idx].q.push_back(pkt);
            state.update_file_transfer_throughput(idx);
        }

        self.cond_notify();
        self.flush_timers();
    }

    fn push_hi(&self, mut pkt: Box<NetPacket>) {
        {
            let mut state = self.shared.state.lock().unwrap();

            state.pre_emplace(HIQ, &mut pkt);
            state.subqs[HIQ].q.push_back(pkt);
        }

        self.cond_notify();
    }

    fn repush(&self, mut pkt: Box<NetPacket>) {
        {
            let mut state = self.shared.state.lock().unwrap();

            state.pre_emplace(HIQ, &mut pkt);

            // A SYN packet carries connection state the receiver needs
            // first; it goes back to the very head of the queue
            if pkt.hdr.flags.syn {
                state.subqs[HIQ].q.push_front(pkt);
            } else {
                state.subqs[HIQ].q.push_back(pkt);
            }
        }

        self.cond_notify();
    }

    fn pop(&self) -> Option<Box<NetPacket>> {
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if self.shared.kicked.swap(false, Ordering::AcqRel) {
                return None;
            }
            if state.done {
                return None;
            }
            if state.nitems > 0 {
                break;
            }

            state = self.shared.cond.wait(state).unwrap();
        }

        let now = MonoClock::now();

        if state.need_sort {
            state.sort_queues();
        }

        let order = state.order.clone();
        let n = order.len();
        let mut result = None;

        // First pass: serve mandated flows in descending priority order
        for &idx in &order {
            if state.subqs[idx].active {
                if let Some(pkt) = state.subq_pop(idx, now, false) {
                    result = Some(pkt);
                    break;
                }
            }

            // If there is no bonus phase and this queue could not produce a
            // packet, deactivate it
            if !state.bonus_phase {
                state.deactivate(idx);
            }
        }

        // Bonus pass: all mandates served, send bonus traffic round-robin
        if result.is_none() && state.bonus_phase && n > 0 {
            let start = if state.bonus_idx >= n { 0 } else { state.bonus_idx };

            for k in 0..n {
                let pos = (start + k) % n;
                let idx = order[pos];

                if state.subqs[idx].active {
                    if let Some(pkt) = state.subq_pop(idx, now, true) {
                        state.bonus_idx = pos + 1;
                        result = Some(pkt);
                        break;
                    }
                }

                state.deactivate(idx);
            }
        }

        drop(state);
        self.flush_timers();
        result
    }

    fn kick(&self) {
        self.shared.kicked.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    fn stop(&self) {
        self.shared.state.lock().unwrap().done = true;
        self.shared.cond.notify_all();
    }

    fn reset(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let bonus_phase = state.bonus_phase;

        *state = State::new(bonus_phase);
    }

    fn set_send_window_status(&self, node: NodeId, open: bool) {
        let mut state = self.shared.state.lock().unwrap();

        state.send_windows.insert(node, open);

        // Activate any queues associated with the node whose window just
        // opened
        if open {
            for idx in 0..state.subqs.len() {
                if state.subqs[idx].nexthop == Some(node) {
                    state.activate(idx);
                }
            }
            drop(state);
            self.cond_notify();
        }
    }

    fn update_mcs_rate(&self, node: NodeId, rate: f64) {
        let mut state = self.shared.state.lock().unwrap();

        state.node_rates.insert(node, rate);

        for idx in 0..state.subqs.len() {
            if state.subqs[idx].nexthop == Some(node) {
                state.update_rate(idx, rate);
            }
        }
    }

    fn set_transmission_delay(&self, delay: f64) {
        self.shared.state.lock().unwrap().transmission_delay = delay;
    }

    fn transmission_delay(&self) -> f64 {
        self.shared.state.lock().unwrap().transmission_delay
    }
}

impl MandateQueue {
    fn cond_notify(&self) {
        self.shared.cond.notify_one();
    }
}

impl PacketSource<Box<NetPacket>> for MandateQueue {
    fn recv(&self) -> Option<Box<NetPacket>> {
        self.pop()
    }

    fn kick(&self) {
        NetQueue::kick(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_core::header::EHDR_SIZE;
    use meshradio_core::ExtendedHeader;

    fn pkt(flow: Option<FlowUid>, nbytes: usize) -> Box<NetPacket> {
        let mut p = NetPacket::with_capacity(EHDR_SIZE + nbytes);

        p.set_ehdr(ExtendedHeader {
            data_len: nbytes as u16,
            ..Default::default()
        });
        p.flow_uid = flow;
        p.payload_size = nbytes;
        p.timestamp = MonoClock::now();
        p.hdr.nexthop = 2;
        Box::new(p)
    }

    fn mandate(flow: FlowUid, bps: f64, point_value: f64) -> Mandate {
        Mandate {
            flow_uid: flow,
            min_throughput_bps: Some(bps),
            point_value,
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_pop_order() {
        let q = MandateQueue::new(false);

        for i in 0..3u16 {
            let mut p = pkt(None, 10);
            p.hdr.seq = meshradio_core::Seq(i);
            q.push(p);
        }

        for i in 0..3u16 {
            assert_eq!(q.pop().unwrap().hdr.seq.0, i);
        }
    }

    #[test]
    fn test_deadline_drop() {
        let q = MandateQueue::new(false);
        let now = MonoClock::now();

        // Packet A's deadline has already passed; packet B's has not
        let mut a = pkt(None, 10);
        a.deadline = Some(now - 0.005);
        a.hdr.seq = meshradio_core::Seq(1);

        let mut b = pkt(None, 10);
        b.deadline = Some(now + 0.5);
        b.hdr.seq = meshradio_core::Seq(2);

        q.push(a);
        q.push(b);

        // A is dropped on pop; B comes out
        let popped = q.pop().unwrap();
        assert_eq!(popped.hdr.seq.0, 2);
    }

    #[test]
    fn test_token_bucket_bounds() {
        let q = MandateQueue::new(false);

        q.set_mandates(HashMap::from([(7, mandate(7, 8000.0, 1.0))]));

        // min throughput = 1000 B/s, so max tokens = 2000
        for _ in 0..5 {
            q.push(pkt(Some(7), 100));
        }

        for _ in 0..5 {
            let popped = q.pop();

            assert!(popped.is_some());

            let state = q.shared.state.lock().unwrap();
            let idx = state.flow_qs[&7];
            let bucket = state.subqs[idx].bucket.as_ref().unwrap();

            assert!(bucket.tokens >= 0.0, "tokens must stay non-negative");
            assert!(bucket.tokens <= bucket.max_tokens, "tokens must stay capped");
        }
    }

    #[test]
    fn test_mandate_priority_order() {
        let q = MandateQueue::new(false);

        // Equal throughput mandates; Y is worth 10x more than X
        q.set_mandates(HashMap::from([
            (1, mandate(1, 1_000_000.0, 10.0)),
            (2, mandate(2, 1_000_000.0, 100.0)),
        ]));
        q.update_mcs_rate(2, 1.0);

        for _ in 0..1000 {
            q.push(pkt(Some(1), 10));
            q.push(pkt(Some(2), 10));
        }

        let mut from_y = 0usize;
        let mut from_x = 0usize;

        for _ in 0..1000 {
            match q.pop() {
                Some(p) if p.flow_uid == Some(2) => from_y += 1,
                Some(p) if p.flow_uid == Some(1) => from_x += 1,
                _ => {}
            }
        }

        // Y's priority dominates, so pops overwhelmingly favor Y
        assert!(from_y >= 9 * from_x.max(1), "y={} x={}", from_y, from_x);
    }

    #[test]
    fn test_send_window_gates_queue() {
        let q = MandateQueue::new(false);

        // A mandated flow, so the queue learns its next hop
        q.set_mandates(HashMap::from([(
            5,
            Mandate {
                flow_uid: 5,
                point_value: 1.0,
                ..Default::default()
            },
        )]));

        q.push(pkt(Some(5), 10));
        q.set_send_window_status(2, false);

        // The only packet's next hop window is closed
        assert!(q.pop().is_none());

        q.set_send_window_status(2, true);
        assert!(q.pop().is_some());
    }

    #[test]
    fn test_bonus_phase_round_robin() {
        let q = MandateQueue::new(true);

        // Two flows whose mandated rate is zero: their buckets never hold
        // tokens, so they are only ever served as bonus traffic
        q.set_mandates(HashMap::from([
            (1, mandate(1, 0.0, 1.0)),
            (2, mandate(2, 0.0, 1.0)),
        ]));

        for _ in 0..4 {
            q.push(pkt(Some(1), 1000));
            q.push(pkt(Some(2), 1000));
        }

        // Every pop is bonus traffic, served round-robin across the flows
        let mut flows = Vec::new();
        for _ in 0..4 {
            flows.push(q.pop().unwrap().flow_uid.unwrap());
        }

        assert_ne!(flows[0], flows[1]);
        assert_eq!(flows[2], flows[0]);
        assert_eq!(flows[3], flows[1]);
    }

    #[test]
    fn test_repush_syn_goes_first() {
        let q = MandateQueue::new(false);

        let mut p1 = pkt(None, 10);
        p1.hdr.seq = meshradio_core::Seq(1);
        q.push_hi(p1);

        let mut p2 = pkt(None, 10);
        p2.hdr.seq = meshradio_core::Seq(2);
        p2.hdr.flags.syn = true;
        q.repush(p2);

        assert_eq!(q.pop().unwrap().hdr.seq.0, 2);
        assert_eq!(q.pop().unwrap().hdr.seq.0, 1);
    }

    #[test]
    fn test_stop_unblocks_pop() {
        let q = MandateQueue::new(false);
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.pop());

        std::thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(t.join().unwrap().is_none());
    }
}
