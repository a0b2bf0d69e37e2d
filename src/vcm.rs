//! Vehicle Configuration Model (§4.1).
//!
//! Parses the line-oriented text config into an immutable [`Vcm`]: an
//! ordered list of [`Measurement`]s and [`Packet`]s, plus the auxiliary
//! `net` device table and a lazily-parsed constants file. Parsing is
//! strict — any error aborts the owning process; the `Vcm` never
//! partially initializes (a half-built one is simply dropped on `Err`).

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::GswError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    /// The endianness of the host this process is running on.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    Int,
    Float,
    String,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Signed,
    Unsigned,
}

/// One `(packet_index, byte_offset)` location a measurement appears at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub packet_index: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub name: String,
    pub size: usize,
    pub r#type: MeasurementType,
    pub sign: Sign,
    pub endianness: Endianness,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub index: usize,
    pub size: usize,
    /// UDP destination port for non-virtual packets; 0 for virtual (invariant 6).
    pub port: u16,
    pub is_virtual: bool,
    /// Measurement names contained in this packet, in declaration order.
    pub measurement_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NetDevice {
    pub name: String,
    pub mode: NetMode,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    Auto,
    Static,
}

/// A vehicle's full, immutable configuration.
pub struct Vcm {
    pub device: String,
    pub port: Option<u16>,
    pub multicast_addr: Option<String>,
    pub trigger_file: Option<String>,
    constants_file: Option<String>,
    pub net_devices: Vec<NetDevice>,
    pub measurements: Vec<Measurement>,
    pub packets: Vec<Packet>,
    pub system_endianness: Endianness,
    pub receiver_endianness: Endianness,

    measurement_index: HashMap<String, usize>,
    constants: OnceLock<HashMap<String, String>>,
    config_dir: std::path::PathBuf,
}

impl fmt::Debug for Vcm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcm")
            .field("device", &self.device)
            .field("packets", &self.packets.len())
            .field("measurements", &self.measurements.len())
            .finish()
    }
}

impl Vcm {
    /// Parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GswError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        Self::parse(&text, config_dir)
    }

    /// Parse configuration text directly (used by tests and by tools that
    /// already have the text in hand).
    pub fn parse(text: &str, config_dir: std::path::PathBuf) -> Result<Self, GswError> {
        let mut protocol: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut multicast_addr: Option<String> = None;
        let mut device: Option<String> = None;
        let mut trigger_file: Option<String> = None;
        let mut constants_file: Option<String> = None;
        let mut net_devices = Vec::new();

        let mut measurements: Vec<Measurement> = Vec::new();
        let mut measurement_index: HashMap<String, usize> = HashMap::new();
        let mut packets: Vec<Packet> = Vec::new();
        let mut receiver_endianness = Endianness::Little;
        let mut saw_explicit_endianness = false;

        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0usize;
        while i < lines.len() {
            let raw = lines[i];
            let line = raw.trim();
            i += 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(open_brace) = line.find('{') {
                // packet block: `<port-or-virtual> {`
                let header = line[..open_brace].trim();
                if header.is_empty() {
                    return Err(parse_err("a packet block header must name a port or 'virtual'"));
                }
                let is_virtual = header == "virtual";
                let port_num: u16 = if is_virtual {
                    0
                } else {
                    header
                        .parse()
                        .map_err(|_| parse_err(&format!("invalid packet port '{header}'")))?
                };
                if !is_virtual && packets.iter().any(|p| !p.is_virtual && p.port == port_num) {
                    return Err(parse_err(&format!("duplicate packet port {port_num}")));
                }

                let mut body_names = Vec::new();
                // body may continue on the same line after '{' or on following lines,
                // terminated by a line containing '}'.
                let mut rest = line[open_brace + 1..].trim();
                loop {
                    if let Some(close) = rest.find('}') {
                        for tok in rest[..close].split_whitespace() {
                            body_names.push(tok.to_string());
                        }
                        break;
                    } else {
                        if !rest.is_empty() {
                            for tok in rest.split_whitespace() {
                                body_names.push(tok.to_string());
                            }
                        }
                        if i >= lines.len() {
                            return Err(parse_err("unterminated packet block"));
                        }
                        rest = lines[i].trim();
                        i += 1;
                    }
                }

                let packet_index = packets.len();
                let mut offset = 0usize;
                let mut packet_size = 0usize;
                for name in &body_names {
                    let meas_idx = *measurement_index
                        .get(name)
                        .ok_or_else(|| parse_err(&format!("undeclared measurement '{name}' referenced in packet block")))?;
                    let meas = &mut measurements[meas_idx];
                    meas.locations.push(Location { packet_index, offset });
                    offset += meas.size;
                    packet_size += meas.size;
                }

                packets.push(Packet {
                    index: packet_index,
                    size: packet_size,
                    port: port_num,
                    is_virtual,
                    measurement_names: body_names,
                });
                continue;
            }

            if let Some(rest) = line.strip_prefix("net ") {
                let toks: Vec<&str> = rest.split_whitespace().collect();
                if toks.len() < 2 {
                    return Err(parse_err("'net' line requires at least a name and a mode"));
                }
                let mode = match toks[1] {
                    "auto" => NetMode::Auto,
                    "static" => NetMode::Static,
                    other => return Err(parse_err(&format!("unknown net mode '{other}'"))),
                };
                net_devices.push(NetDevice {
                    name: toks[0].to_string(),
                    mode,
                    args: toks[2..].iter().map(|s| s.to_string()).collect(),
                });
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "protocol" => protocol = Some(value.to_string()),
                    "port" => {
                        port = Some(
                            value
                                .parse()
                                .map_err(|_| parse_err(&format!("invalid port '{value}'")))?,
                        )
                    }
                    "multicast" => multicast_addr = Some(value.to_string()),
                    "name" => device = Some(value.to_string()),
                    "triggers" => trigger_file = Some(value.to_string()),
                    "constants" => constants_file = Some(value.to_string()),
                    _ => {
                        // fall through to measurement-definition parsing below; a bare
                        // `key = value` that isn't one of the recognized scalar settings
                        // is a configuration error, not a measurement (measurements never
                        // contain '=').
                        return Err(parse_err(&format!("unrecognized setting '{key}'")));
                    }
                }
                continue;
            }

            // measurement definition: `<name> <size> [type] [endianness] [sign]`
            let toks: Vec<&str> = line.split_whitespace().collect();
            if toks.len() < 2 {
                return Err(parse_err(&format!("malformed line '{line}'")));
            }
            let name = toks[0].to_string();
            if measurement_index.contains_key(&name) {
                return Err(parse_err(&format!("duplicate measurement definition '{name}'")));
            }
            let size: usize = toks[1]
                .parse()
                .map_err(|_| parse_err(&format!("invalid size for measurement '{name}'")))?;

            let mut r#type = MeasurementType::Undefined;
            let mut endianness = receiver_endianness;
            let mut sign = Sign::Signed;
            for tok in &toks[2..] {
                match *tok {
                    "int" => r#type = MeasurementType::Int,
                    "float" => r#type = MeasurementType::Float,
                    "string" => r#type = MeasurementType::String,
                    "big" => {
                        endianness = Endianness::Big;
                        saw_explicit_endianness = true;
                    }
                    "little" => {
                        endianness = Endianness::Little;
                        saw_explicit_endianness = true;
                    }
                    "signed" => sign = Sign::Signed,
                    "unsigned" => sign = Sign::Unsigned,
                    other => return Err(parse_err(&format!("unrecognized measurement attribute '{other}'"))),
                }
            }
            if !saw_explicit_endianness {
                // first measurement to declare an explicit endianness sets the config's
                // default for subsequent measurements that omit it; until then, Little.
            }

            let idx = measurements.len();
            measurement_index.insert(name.clone(), idx);
            measurements.push(Measurement {
                name,
                size,
                r#type,
                sign,
                endianness,
                locations: Vec::new(),
            });
        }

        let protocol = protocol.ok_or_else(|| parse_err("'protocol' is mandatory"))?;
        if protocol != "udp" {
            return Err(parse_err(&format!("unsupported protocol '{protocol}'")));
        }
        let device = device.ok_or_else(|| parse_err("'name' is mandatory"))?;

        for meas in &measurements {
            for loc in &meas.locations {
                let packet = &packets[loc.packet_index];
                if loc.offset + meas.size > packet.size {
                    return Err(parse_err(&format!(
                        "measurement '{}' location (packet {}, offset {}) exceeds packet bounds",
                        meas.name, loc.packet_index, loc.offset
                    )));
                }
            }
        }

        Ok(Vcm {
            device,
            port,
            multicast_addr,
            trigger_file,
            constants_file,
            net_devices,
            measurements,
            packets,
            system_endianness: Endianness::native(),
            receiver_endianness,
            measurement_index,
            constants: OnceLock::new(),
            config_dir,
        })
    }

    pub fn get_info(&self, name: &str) -> Option<&Measurement> {
        self.measurement_index.get(name).map(|&i| &self.measurements[i])
    }

    pub fn get_info_index(&self, name: &str) -> Option<usize> {
        self.measurement_index.get(name).copied()
    }

    pub fn packet(&self, index: usize) -> Option<&Packet> {
        self.packets.get(index)
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    /// Lazily parses the constants file on first lookup, per §4.1.
    pub fn constant(&self, name: &str) -> Result<Option<String>, GswError> {
        let map = self.constants.get_or_init_fallible(|| self.load_constants())?;
        Ok(map.get(name).cloned())
    }

    fn load_constants(&self) -> Result<HashMap<String, String>, GswError> {
        let mut map = HashMap::new();
        let Some(file) = &self.constants_file else {
            return Ok(map);
        };
        let path = self.config_dir.join(file);
        let text = fs::read_to_string(&path)?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Ok(map)
    }
}

/// `OnceLock::get_or_init` has no fallible variant in std; this is the
/// small helper the rest of the module needs instead. Safe under races: if
/// two threads both miss the fast path and both compute a value, only one
/// `set` wins and both return the winner's value.
trait OnceLockExt<T> {
    fn get_or_init_fallible<F>(&self, f: F) -> Result<&T, GswError>
    where
        F: FnOnce() -> Result<T, GswError>;
}

impl<T> OnceLockExt<T> for OnceLock<T> {
    fn get_or_init_fallible<F>(&self, f: F) -> Result<&T, GswError>
    where
        F: FnOnce() -> Result<T, GswError>,
    {
        if let Some(v) = self.get() {
            return Ok(v);
        }
        let v = f()?;
        let _ = self.set(v);
        Ok(self.get().expect("just initialized"))
    }
}

fn parse_err(message: &str) -> GswError {
    GswError::failure("VCM", "parse", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
protocol = udp
port     = 8081
multicast = 224.0.0.5
name     = rocket
triggers = triggers.txt
net WIRELESS auto 9000
MEAS_A 4 int little unsigned
MEAS_B 8 float big
MEAS_S 16 string
8081 {
  MEAS_A
  MEAS_B
}
virtual {
  MEAS_S
}
"#;

    #[test]
    fn parses_sample_config() {
        let vcm = Vcm::parse(SAMPLE, std::path::PathBuf::from(".")).unwrap();
        assert_eq!(vcm.device, "rocket");
        assert_eq!(vcm.packets.len(), 2);
        assert_eq!(vcm.packets[0].port, 8081);
        assert!(!vcm.packets[0].is_virtual);
        assert!(vcm.packets[1].is_virtual);
        assert_eq!(vcm.packets[1].port, 0);

        let a = vcm.get_info("MEAS_A").unwrap();
        assert_eq!(a.size, 4);
        assert_eq!(a.r#type, MeasurementType::Int);
        assert_eq!(a.sign, Sign::Unsigned);
        assert_eq!(a.locations[0], Location { packet_index: 0, offset: 0 });

        let b = vcm.get_info("MEAS_B").unwrap();
        assert_eq!(b.locations[0], Location { packet_index: 0, offset: 4 });
        assert_eq!(vcm.packets[0].size, 12);

        assert_eq!(vcm.net_devices.len(), 1);
        assert_eq!(vcm.net_devices[0].name, "WIRELESS");
    }

    #[test]
    fn rejects_undeclared_measurement_in_packet() {
        let bad = "protocol = udp\nname = x\n8081 {\n  NOPE\n}\n";
        assert!(Vcm::parse(bad, std::path::PathBuf::from(".")).is_err());
    }

    #[test]
    fn rejects_duplicate_port() {
        let bad = "protocol = udp\nname = x\nA 1\n8081 {\n  A\n}\n8081 {\n  A\n}\n";
        assert!(Vcm::parse(bad, std::path::PathBuf::from(".")).is_err());
    }

    #[test]
    fn rejects_missing_protocol() {
        let bad = "name = x\n";
        assert!(Vcm::parse(bad, std::path::PathBuf::from(".")).is_err());
    }

    #[test]
    fn virtual_packet_has_zero_port() {
        let vcm = Vcm::parse(SAMPLE, std::path::PathBuf::from(".")).unwrap();
        let virt = vcm.packets.iter().find(|p| p.is_virtual).unwrap();
        assert_eq!(virt.port, 0);
    }
}
