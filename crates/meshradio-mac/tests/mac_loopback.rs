//! Full-stack MAC test: a node modulates traffic into its TDMA slots,
//! transmits over the in-process loopback radio, and demodulates its own
//! signal back through the channelizer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshradio_core::header::EHDR_SIZE;
use meshradio_core::{Channel, ExtendedHeader, NetPacket, RadioPacket, Schedule, Seq};
use meshradio_net::element::FnSink;
use meshradio_net::queue::NetQueue;
use meshradio_net::FifoQueue;
use meshradio_phy::dsp::ResamplerParams;
use meshradio_phy::raw::RawPhy;
use meshradio_phy::{MultichannelSynthesizer, ParallelDemodulator, PhyChannel};

use meshradio_mac::{LoopbackRadio, MacConfig, PassthroughController, Radio, SlottedMac, Tdma};

const PARAMS: ResamplerParams = ResamplerParams { p: 129, v: 2 };
const RATE: f64 = 40960.0;
const SLOT_SIZE: f64 = 0.05;
const GUARD_SIZE: f64 = 0.01;

fn mk_netpacket(data: &[u8], seq: u16) -> Box<NetPacket> {
    let mut pkt = NetPacket::with_capacity(EHDR_SIZE + data.len());

    pkt.hdr.curhop = 1;
    pkt.hdr.nexthop = 2;
    pkt.hdr.seq = Seq(seq);
    pkt.hdr.flags.has_seq = true;
    pkt.set_ehdr(ExtendedHeader {
        src: 1,
        dest: 2,
        ack: Seq(0),
        data_len: data.len() as u16,
    });
    pkt.payload[EHDR_SIZE..].copy_from_slice(data);
    Box::new(pkt)
}

#[test]
fn test_tdma_self_loopback() {
    let radio: Arc<LoopbackRadio> = Arc::new(LoopbackRadio::new(RATE));
    let schedule = Schedule::new(vec![vec![true, false]], SLOT_SIZE, GUARD_SIZE);

    let channels = vec![PhyChannel::new(
        Channel::new(RATE / 4.0, RATE / 4.0),
        Arc::new(RawPhy::new()),
    )];

    let synthesizer = Arc::new(
        MultichannelSynthesizer::new(channels.clone(), schedule.clone(), RATE, 1, PARAMS).unwrap(),
    );
    let demodulator = Arc::new(ParallelDemodulator::new(channels, RATE, 1, PARAMS));

    // Queue -> controller -> synthesizer; demodulator -> controller ->
    // received packets
    let netq = Arc::new(FifoQueue::new());
    let controller = Arc::new(PassthroughController::new(netq.clone()));

    synthesizer.sink().connect(controller.clone());

    let received: Arc<Mutex<Vec<Box<RadioPacket>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_sink = Arc::clone(&received);

    controller
        .radio_out
        .connect(Arc::new(FnSink::new(move |pkt: Box<RadioPacket>| {
            received_sink.lock().unwrap().push(pkt);
        })));

    let delivery = Arc::clone(&controller);

    demodulator
        .source()
        .connect(Arc::new(FnSink::new(move |pkt: Box<RadioPacket>| {
            meshradio_mac::Controller::received(&*delivery, pkt);
        })));

    let mac = SlottedMac::new(
        radio.clone() as Arc<dyn Radio>,
        controller.clone(),
        None,
        Arc::clone(&synthesizer),
        Arc::clone(&demodulator),
        Box::new(Tdma),
        MacConfig {
            schedule,
            rx_period: SLOT_SIZE,
            slot_send_lead_time: 5e-3,
        },
    );

    // Send a 200-byte payload from node 1 to node 2
    let data: Vec<u8> = (0..200u32).map(|i| (i * 13 % 241) as u8).collect();

    netq.push(mk_netpacket(&data, 0));

    // The packet should loop back within a handful of slots; missed
    // deadlines re-queue it, so keep waiting
    let deadline = Instant::now() + Duration::from_secs(10);

    while received.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    mac.stop();
    synthesizer.stop();
    demodulator.stop();
    netq.stop();

    let received = received.lock().unwrap();

    assert!(!received.is_empty(), "packet never looped back");

    let pkt = &received[0];

    assert_eq!(pkt.hdr.curhop, 1);
    assert_eq!(pkt.hdr.nexthop, 2);
    assert_eq!(pkt.ehdr().data_len, 200);
    assert_eq!(pkt.data(), &data[..]);
    assert!(pkt.integrity_intact());
}
