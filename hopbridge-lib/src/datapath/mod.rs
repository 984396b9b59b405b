use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use aya::programs::{ProgramError, Xdp, XdpFlags};
use aya::{Ebpf, EbpfError};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use thiserror::Error;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

pub mod codec;

pub use codec::{RULE_KEY_LEN, RULE_VALUE_LEN, RuleKey, RuleValue};

/// Attach point of the address rewriter inside the datapath object.
pub const BRIDGE_PROGRAM: &str = "xdp_bridge_prog";
/// Attach point of the filter program for the external outbound interface.
pub const WG_FILTER_PROGRAM: &str = "xdp_wg_filter_prog";

const SRC_RULES_MAP: &str = "src_rules";
const DST_RULES_MAP: &str = "dst_rules";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load datapath object: {0}")]
    Load(#[from] EbpfError),
    #[error("program `{0}` not found in datapath object")]
    MissingProgram(&'static str),
    #[error("map `{0}` not found in datapath object")]
    MissingMap(&'static str),
    #[error("datapath program error: {0}")]
    Program(#[from] ProgramError),
    #[error("datapath map error: {0}")]
    Map(#[from] MapError),
    #[error("rule codec error: {0}")]
    Codec(#[from] codec::Error),
    #[error("failed to raise memlock limit: {0}")]
    Memlock(nix::Error),
}

/// Which of the two rewrite maps an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rules {
    Src,
    Dst,
}

type RulesMap = BpfHashMap<MapData, [u8; RULE_KEY_LEN], [u8; RULE_VALUE_LEN]>;

/// One loaded rewriter program attached to one interface, plus its two
/// address-keyed maps. Dropping the handle detaches the program and closes
/// the maps.
pub struct DatapathHandle {
    src_rules: Mutex<RulesMap>,
    dst_rules: Mutex<RulesMap>,
    _ebpf: Ebpf,
}

/// The wg filter has no maps; it only needs to stay attached.
pub struct FilterHandle {
    _ebpf: Ebpf,
}

/// Verifies the kernel accepts the rewriter: loading the object exercises
/// both the XDP program type and the hash map type in one step.
pub fn probe(object: &Path) -> Result<(), Error> {
    let mut ebpf = Ebpf::load_file(object)?;
    let program: &mut Xdp = ebpf
        .program_mut(BRIDGE_PROGRAM)
        .ok_or(Error::MissingProgram(BRIDGE_PROGRAM))?
        .try_into()?;
    program.load()?;
    Ok(())
}

pub fn raise_memlock_limit() -> Result<(), Error> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY).map_err(Error::Memlock)
}

/// Loads the rewriter from `object` and attaches it to the interface with
/// index `ifindex` in generic (skb) mode.
pub fn install(object: &Path, ifindex: u32) -> Result<DatapathHandle, Error> {
    let mut ebpf = Ebpf::load_file(object)?;

    let program: &mut Xdp = ebpf
        .program_mut(BRIDGE_PROGRAM)
        .ok_or(Error::MissingProgram(BRIDGE_PROGRAM))?
        .try_into()?;
    program.load()?;
    program.attach_to_if_index(ifindex, XdpFlags::SKB_MODE)?;

    let src_rules = ebpf
        .take_map(SRC_RULES_MAP)
        .ok_or(Error::MissingMap(SRC_RULES_MAP))?;
    let dst_rules = ebpf
        .take_map(DST_RULES_MAP)
        .ok_or(Error::MissingMap(DST_RULES_MAP))?;

    Ok(DatapathHandle {
        src_rules: Mutex::new(RulesMap::try_from(src_rules)?),
        dst_rules: Mutex::new(RulesMap::try_from(dst_rules)?),
        _ebpf: ebpf,
    })
}

/// Attaches the wg filter program to the external outbound interface.
pub fn install_wg_filter(object: &Path, ifindex: u32) -> Result<FilterHandle, Error> {
    let mut ebpf = Ebpf::load_file(object)?;

    let program: &mut Xdp = ebpf
        .program_mut(WG_FILTER_PROGRAM)
        .ok_or(Error::MissingProgram(WG_FILTER_PROGRAM))?
        .try_into()?;
    program.load()?;
    program.attach_to_if_index(ifindex, XdpFlags::SKB_MODE)?;

    Ok(FilterHandle { _ebpf: ebpf })
}

impl DatapathHandle {
    pub fn set_src_rule(&self, ip: IpAddr, replace: IpAddr, ifindex: u32) -> Result<(), Error> {
        Self::put(&self.src_rules, ip, replace, ifindex)
    }

    pub fn set_dst_rule(&self, ip: IpAddr, replace: IpAddr, ifindex: u32) -> Result<(), Error> {
        Self::put(&self.dst_rules, ip, replace, ifindex)
    }

    pub fn delete_src_rule(&self, ip: IpAddr) -> Result<(), Error> {
        let key = RuleKey::new(ip).encode();
        let mut rules = self.src_rules.lock().expect("src rules lock poisoned");
        rules.remove(&key)?;
        Ok(())
    }

    pub fn delete_dst_rule(&self, ip: IpAddr) -> Result<(), Error> {
        let key = RuleKey::new(ip).encode();
        let mut rules = self.dst_rules.lock().expect("dst rules lock poisoned");
        rules.remove(&key)?;
        Ok(())
    }

    /// Returns the rule for `ip`, or `None` when no such key is programmed.
    pub fn lookup(&self, rules: Rules, ip: IpAddr) -> Result<Option<RuleValue>, Error> {
        let key = RuleKey::new(ip).encode();
        let map = self.map(rules).lock().expect("rules lock poisoned");
        match map.get(&key, 0) {
            Ok(data) => Ok(Some(RuleValue::decode(&data)?)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn iterate(&self, rules: Rules) -> Result<Vec<(RuleKey, RuleValue)>, Error> {
        let map = self.map(rules).lock().expect("rules lock poisoned");
        let mut entries = Vec::new();
        for item in map.iter() {
            let (key, value) = item?;
            entries.push((RuleKey::decode(&key)?, RuleValue::decode(&value)?));
        }
        Ok(entries)
    }

    /// Logs both maps, used when tracing bridge setup.
    pub fn dump_maps(&self, ifindex: u32) {
        for (rules, label) in [(Rules::Src, "src"), (Rules::Dst, "dst")] {
            match self.iterate(rules) {
                Ok(entries) => {
                    for (key, value) in entries {
                        tracing::debug!(
                            ifindex,
                            map = label,
                            key = %key.ip,
                            replace = %value.replace,
                            to_ifindex = value.ifindex,
                            packets = value.packets,
                            bytes = value.bytes,
                            "rule map entry"
                        );
                    }
                }
                Err(e) => tracing::warn!(ifindex, map = label, error = %e, "failed to iterate rule map"),
            }
        }
    }

    fn put(map: &Mutex<RulesMap>, ip: IpAddr, replace: IpAddr, ifindex: u32) -> Result<(), Error> {
        let key = RuleKey::new(ip).encode();
        let value = RuleValue::new(replace, ifindex).encode();
        let mut rules = map.lock().expect("rules lock poisoned");
        rules.insert(key, value, 0)?;
        Ok(())
    }

    fn map(&self, rules: Rules) -> &Mutex<RulesMap> {
        match rules {
            Rules::Src => &self.src_rules,
            Rules::Dst => &self.dst_rules,
        }
    }
}
