use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use super::stack_config::{
    CfgChannel, CfgMac, CfgNet, CfgQueue, CfgRadio, CfgThreads, MacMode, RadioBackend, SharedConfig,
    StackConfig,
};

/// Build `SharedConfig` from a TOML configuration file
pub fn from_toml_str(toml_str: &str) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    // Various sanity checks
    let expected_config_version = "0.3";
    if !root.config_version.eq(expected_config_version) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, expected_config_version
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    if let Some(ref radio) = root.radio {
        if !radio.extra.is_empty() {
            return Err(format!("Unrecognized fields: radio::{:?}", sorted_keys(&radio.extra)).into());
        }
    }
    if let Some(ref mac) = root.mac {
        if !mac.extra.is_empty() {
            return Err(format!("Unrecognized fields: mac::{:?}", sorted_keys(&mac.extra)).into());
        }
    }
    if let Some(ref net) = root.net {
        if !net.extra.is_empty() {
            return Err(format!("Unrecognized fields: net::{:?}", sorted_keys(&net.extra)).into());
        }
    }
    if let Some(ref queue) = root.queue {
        if !queue.extra.is_empty() {
            return Err(format!("Unrecognized fields: queue::{:?}", sorted_keys(&queue.extra)).into());
        }
    }

    // Build config from required and optional values
    let mut cfg = StackConfig {
        debug_log: root.debug_log,
        log_dir: root.log_dir,
        ..Default::default()
    };

    if let Some(radio) = root.radio {
        apply_radio_patch(&mut cfg.radio, radio)?;
    }
    if let Some(mac) = root.mac {
        apply_mac_patch(&mut cfg.mac, mac)?;
    }
    if let Some(net) = root.net {
        apply_net_patch(&mut cfg.net, net)?;
    }
    if let Some(queue) = root.queue {
        if let Some(v) = queue.bonus_phase {
            cfg.queue = CfgQueue { bonus_phase: v };
        }
    }
    if let Some(threads) = root.threads {
        cfg.threads = CfgThreads {
            synthesizer: threads.synthesizer.unwrap_or(cfg.threads.synthesizer),
            demodulator: threads.demodulator.unwrap_or(cfg.threads.demodulator),
        };
    }

    Ok(SharedConfig::from_config(cfg))
}

/// Build `SharedConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `SharedConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let f = File::open(path)?;
    let r = BufReader::new(f);
    from_reader(r)
}

fn apply_radio_patch(dst: &mut CfgRadio, src: RadioDto) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = src.backend {
        dst.backend = backend;
    }
    if let Some(v) = src.tx_rate {
        dst.tx_rate = v;
    }
    if let Some(v) = src.rx_rate {
        dst.rx_rate = v;
    }
    if let Some(channels) = src.channels {
        dst.channels = channels
            .into_iter()
            .map(|c| CfgChannel { fc: c.fc, bw: c.bw })
            .collect();

        if dst.channels.is_empty() {
            return Err("radio.channels must not be empty".into());
        }
    }
    dst.tx_capture_file = src.tx_capture_file;
    dst.rx_capture_file = src.rx_capture_file;

    Ok(())
}

fn apply_mac_patch(dst: &mut CfgMac, src: MacDto) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(mode) = src.mode {
        dst.mode = mode;
    }
    if let Some(v) = src.slot_size {
        dst.slot_size = v;
    }
    if let Some(v) = src.guard_size {
        dst.guard_size = v;
    }
    if let Some(v) = src.rx_period {
        dst.rx_period = v;
    }
    if let Some(v) = src.slot_send_lead_time {
        dst.slot_send_lead_time = v;
    }
    if let Some(rows) = src.schedule {
        let slots: Vec<Vec<bool>> = rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v != 0).collect())
            .collect();

        if let Some(first) = slots.first() {
            if slots.iter().any(|r: &Vec<bool>| r.len() != first.len()) {
                return Err("mac.schedule rows must have equal length".into());
            }
        }
        dst.schedule = slots;
    }
    if let Some(v) = src.aloha_p {
        if !(0.0..=1.0).contains(&v) {
            return Err("mac.aloha_p must be in [0, 1]".into());
        }
        dst.aloha_p = v;
    }
    if dst.guard_size >= dst.slot_size {
        return Err("mac.guard_size must be smaller than mac.slot_size".into());
    }

    Ok(())
}

fn apply_net_patch(dst: &mut CfgNet, src: NetDto) -> Result<(), Box<dyn std::error::Error>> {
    dst.node_id = src.node_id;

    if let Some(v) = src.mtu {
        dst.mtu = v;
    }
    if let Some(ref s) = src.int_net {
        dst.int_net = parse_cidr(s)?;
    }
    if let Some(ref s) = src.ext_net {
        dst.ext_net = parse_cidr(s)?;
    }
    if let Some(v) = src.compress {
        dst.compress = v;
    }

    Ok(())
}

/// Parse "a.b.c.d/n" into (net, netmask)
fn parse_cidr(s: &str) -> Result<(u32, u32), Box<dyn std::error::Error>> {
    let (addr, prefix) = s.split_once('/').ok_or("expected CIDR notation a.b.c.d/n")?;
    let octets: Vec<u8> = addr
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| format!("bad IP address: {}", addr))?;

    if octets.len() != 4 {
        return Err(format!("bad IP address: {}", addr).into());
    }

    let prefix: u32 = prefix.parse()?;
    if prefix > 32 {
        return Err(format!("bad prefix length: {}", prefix).into());
    }

    let net = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };

    Ok((net & mask, mask))
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

#[derive(Debug, Deserialize)]
struct TomlConfigRoot {
    config_version: String,
    debug_log: Option<String>,
    log_dir: Option<String>,
    radio: Option<RadioDto>,
    mac: Option<MacDto>,
    net: Option<NetDto>,
    queue: Option<QueueDto>,
    threads: Option<ThreadsDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ChannelDto {
    fc: f64,
    bw: f64,
}

#[derive(Debug, Deserialize)]
struct RadioDto {
    backend: Option<RadioBackend>,
    tx_rate: Option<f64>,
    rx_rate: Option<f64>,
    channels: Option<Vec<ChannelDto>>,
    tx_capture_file: Option<String>,
    rx_capture_file: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MacDto {
    mode: Option<MacMode>,
    slot_size: Option<f64>,
    guard_size: Option<f64>,
    rx_period: Option<f64>,
    slot_send_lead_time: Option<f64>,
    schedule: Option<Vec<Vec<u8>>>,
    aloha_p: Option<f64>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NetDto {
    node_id: u8,
    mtu: Option<usize>,
    int_net: Option<String>,
    ext_net: Option<String>,
    compress: Option<bool>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueueDto {
    bonus_phase: Option<bool>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ThreadsDto {
    synthesizer: Option<usize>,
    demodulator: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
config_version = "0.3"

[radio]
backend = "Loopback"
tx_rate = 10e6
rx_rate = 10e6
channels = [{ fc = -2.5e6, bw = 1e6 }, { fc = 2.5e6, bw = 1e6 }]

[mac]
mode = "Tdma"
slot_size = 0.035
guard_size = 0.01
schedule = [[1, 0], [0, 1]]

[net]
node_id = 7
int_net = "10.10.10.0/24"
ext_net = "192.168.0.0/16"

[queue]
bonus_phase = true
"#;

    #[test]
    fn test_parse_example() {
        let cfg = from_toml_str(EXAMPLE).unwrap();
        let cfg = cfg.config();

        assert_eq!(cfg.radio.backend, RadioBackend::Loopback);
        assert_eq!(cfg.radio.channels.len(), 2);
        assert_eq!(cfg.mac.schedule, vec![vec![true, false], vec![false, true]]);
        assert_eq!(cfg.net.node_id, 7);
        assert_eq!(cfg.net.int_net, (0x0a0a0a00, 0xffffff00));
        assert!(cfg.queue.bonus_phase);
    }

    #[test]
    fn test_reject_bad_version() {
        let toml = EXAMPLE.replace("\"0.3\"", "\"9.9\"");
        assert!(from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_reject_unknown_field() {
        let toml = format!("{}\n[mac2]\nx = 1\n", EXAMPLE);
        assert!(from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_reject_ragged_schedule() {
        let toml = EXAMPLE.replace("[[1, 0], [0, 1]]", "[[1, 0], [0]]");
        assert!(from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.10.10.0/24").unwrap(), (0x0a0a0a00, 0xffffff00));
        assert_eq!(parse_cidr("192.168.0.0/16").unwrap(), (0xc0a80000, 0xffff0000));
        assert!(parse_cidr("10.10.10.0").is_err());
        assert!(parse_cidr("10.10.10/24").is_err());
    }
}
