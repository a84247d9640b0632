use clap::Parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshradio_config::{MacMode, RadioBackend, SharedConfig, toml_config};
use meshradio_core::logger::{FileSink, Logger, Source};
use meshradio_core::{debug, Channel, NetPacket, RadioPacket, Schedule};
use meshradio_mac::{
    Controller, LoopbackRadio, MacConfig, PassthroughController, Radio, SlottedAloha, SlottedMac,
    Tdma,
};
use meshradio_net::element::{FnSink, PacketSink};
use meshradio_net::netfilter::{build_ipv4_udp, NetFilter, Neighborhood};
use meshradio_net::compressor::PacketCompressor;
use meshradio_net::queue::NetQueue;
use meshradio_net::tuntap::{TunLoop, TunTap};
use meshradio_net::MandateQueue;
use meshradio_phy::dsp::ResamplerParams;
use meshradio_phy::raw::RawPhy;
use meshradio_phy::snapshot::SnapshotCollector;
use meshradio_phy::{MultichannelSynthesizer, ParallelDemodulator, PhyChannel};

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> SharedConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

struct Stack {
    tun: Arc<TunLoop>,
    netq: Arc<MandateQueue>,
    synthesizer: Arc<MultichannelSynthesizer>,
    demodulator: Arc<ParallelDemodulator>,
    mac: SlottedMac,
    tun_thread: Option<std::thread::JoinHandle<()>>,
}

impl Stack {
    /// Stop everything, joining threads in reverse dependency order
    fn shutdown(mut self) {
        self.mac.stop();
        self.synthesizer.stop();
        self.demodulator.stop();
        self.netq.stop();
        self.tun.shutdown();

        if let Some(handle) = self.tun_thread.take() {
            let _ = handle.join();
        }

        if let Some(logger) = Logger::global() {
            logger.stop();
        }
    }
}

/// Assemble the dataflow graph:
///
/// ```text
/// tun -> filter -> compressor -> queue -> controller -> synthesizer -> MAC
/// MAC -> channelizer -> demodulator -> controller -> compressor -> tun
/// ```
fn build_stack(cfg: &SharedConfig) -> Stack {
    let config = cfg.config();

    // Radio
    let radio: Arc<dyn Radio> = match config.radio.backend {
        RadioBackend::Loopback => Arc::new(LoopbackRadio::new(config.radio.rx_rate)),
        RadioBackend::Undefined => {
            panic!("no radio backend configured");
        }
    };

    radio.set_rx_rate(config.radio.rx_rate);
    radio.set_tx_rate(config.radio.tx_rate);

    // PHY channels
    let phy = Arc::new(RawPhy::new());
    let channels: Vec<PhyChannel> = config
        .radio
        .channels
        .iter()
        .map(|c| PhyChannel::new(Channel::new(c.fc, c.bw), phy.clone()))
        .collect();

    let schedule = Schedule::new(
        config.mac.schedule.clone(),
        config.mac.slot_size,
        config.mac.guard_size,
    );

    // DSP stages
    let params = ResamplerParams::default();
    let synthesizer = Arc::new(
        MultichannelSynthesizer::new(
            channels.clone(),
            schedule.clone(),
            radio.tx_rate(),
            config.threads.synthesizer,
            params,
        )
        .expect("failed to configure synthesizer"),
    );
    let demodulator = Arc::new(ParallelDemodulator::new(
        channels,
        radio.rx_rate(),
        config.threads.demodulator,
        params,
    ));

    // Network side
    let tun = Arc::new(TunLoop::new(config.net.mtu));
    let nhood = Arc::new(Neighborhood::new(config.net.node_id));
    let filter = Arc::new(NetFilter::new(nhood, config.net.int_net, config.net.ext_net));
    let compressor = Arc::new(PacketCompressor::new(config.net.compress, config.net.int_net));
    let netq = Arc::new(MandateQueue::new(config.queue.bonus_phase));
    let controller = Arc::new(PassthroughController::new(netq.clone()));

    // TX direction: tun -> filter -> compressor -> queue
    let queue_sink = netq.clone();

    compressor.net_out.connect(Arc::new(FnSink::new(move |pkt: Box<NetPacket>| {
        queue_sink.push(pkt);
    })));

    let compressor_net = compressor.clone();

    filter.net_out.connect(Arc::new(FnSink::new(move |pkt: Box<NetPacket>| {
        PacketSink::<Box<NetPacket>>::send(&*compressor_net, pkt);
    })));

    let filter_sink = filter.clone();
    let tun_reader = tun.clone();
    let tun_thread = std::thread::Builder::new()
        .name("tuntap-read".into())
        .spawn(move || {
            while let Some(pkt) = tun_reader.recv() {
                PacketSink::<Box<NetPacket>>::send(&*filter_sink, pkt);
            }
        })
        .expect("failed to spawn tun reader");

    // Controller feeds the synthesizer
    synthesizer.sink().connect(controller.clone());

    // RX direction: demodulator -> controller -> compressor -> tun
    let delivery = controller.clone();

    demodulator.source().connect(Arc::new(FnSink::new(move |pkt: Box<RadioPacket>| {
        delivery.received(pkt);
    })));

    let compressor_radio = compressor.clone();

    controller.radio_out.connect(Arc::new(FnSink::new(move |pkt: Box<RadioPacket>| {
        PacketSink::<Box<RadioPacket>>::send(&*compressor_radio, pkt);
    })));

    let tun_writer = tun.clone();

    compressor.radio_out.connect(Arc::new(FnSink::new(move |pkt: Box<RadioPacket>| {
        tun_writer.send(&pkt);
    })));

    // Snapshot collection
    let collector = Arc::new(SnapshotCollector::new());

    // The MAC drives it all
    let scheduler: Box<dyn meshradio_mac::slotted::SlotScheduler> = match config.mac.mode {
        MacMode::Tdma => Box::new(Tdma),
        MacMode::SlottedAloha => Box::new(SlottedAloha::new(config.mac.aloha_p)),
    };

    let mac = SlottedMac::new(
        radio,
        controller,
        Some(collector),
        Arc::clone(&synthesizer),
        Arc::clone(&demodulator),
        scheduler,
        MacConfig {
            schedule,
            rx_period: config.mac.rx_period,
            slot_send_lead_time: config.mac.slot_send_lead_time,
        },
    );

    drop(config);

    Stack {
        tun,
        netq,
        synthesizer,
        demodulator,
        mac,
        tun_thread: Some(tun_thread),
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "meshradio node",
    long_about = "Runs the meshradio SDR stack using the provided TOML configuration file"
)]
struct Args {
    /// TOML config with radio/MAC/network parameters
    config: String,

    /// Inject a broadcast datagram per second (loopback demo)
    #[arg(long)]
    demo_traffic: bool,
}

fn main() {
    let args = Args::parse();
    let cfg = load_config_from_toml(&args.config);
    let _log_guard = debug::setup_logging_default(cfg.config().debug_log.clone());

    // Structured on-disk log
    if let Some(ref dir) = cfg.config().log_dir {
        match FileSink::create(dir) {
            Ok(sink) => {
                Logger::init(Box::new(sink));

                if let Some(logger) = Logger::global() {
                    logger.set_collect_source(Source::SentPackets, true);
                    logger.set_collect_source(Source::RecvPackets, true);
                    logger.set_collect_source(Source::TxRecords, true);
                    logger.set_collect_source(Source::Events, true);
                }
            }
            Err(e) => {
                tracing::error!("failed to create log directory {}: {}", dir, e);
            }
        }
    }

    let stack = build_stack(&cfg);

    tracing::info!(
        "meshradio node {} up: {} channel(s), {} slot(s)",
        cfg.config().net.node_id,
        cfg.config().radio.channels.len(),
        cfg.config().mac.schedule.first().map_or(0, Vec::len)
    );

    // Set up Ctrl+C handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl+C handler");

    let node_id = cfg.config().net.node_id;
    let int_net = cfg.config().net.int_net;
    let mut n = 0u32;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));

        if args.demo_traffic {
            let src = int_net.0 | node_id as u32;
            let dest = int_net.0 | !int_net.1;
            let payload = format!("meshradio demo datagram {}", n).into_bytes();

            stack.tun.inject(build_ipv4_udp(src, dest, &payload));
            n += 1;
        }
    }

    tracing::info!("shutting down");
    stack.shutdown();
}
