use thiserror::Error;

use std::net::IpAddr;

/// Binary layout shared with the in-kernel rewriter. Keys and values are
/// fixed-size records in the two hash maps; the address form is a 2-byte
/// family tag at offset 0 and the address bytes at offset 4, padded to 20.
pub const RULE_KEY_LEN: usize = 20;
pub const RULE_VALUE_LEN: usize = 40;

const FAMILY_INET: u16 = 2;
const FAMILY_INET6: u16 = 10;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("wrong rule key length: expected {RULE_KEY_LEN}, got {0}")]
    KeyLength(usize),
    #[error("wrong rule value length: expected {RULE_VALUE_LEN}, got {0}")]
    ValueLength(usize),
    #[error("unknown address family tag: {0}")]
    UnknownFamily(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleKey {
    pub ip: IpAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleValue {
    pub replace: IpAddr,
    pub ifindex: u32,
    pub packets: u64,
    pub bytes: u64,
}

impl RuleKey {
    pub fn new(ip: IpAddr) -> Self {
        RuleKey { ip }
    }

    pub fn encode(&self) -> [u8; RULE_KEY_LEN] {
        let mut data = [0u8; RULE_KEY_LEN];
        encode_ip(self.ip, &mut data);
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != RULE_KEY_LEN {
            return Err(Error::KeyLength(data.len()));
        }
        Ok(RuleKey {
            ip: decode_ip(data)?,
        })
    }
}

impl RuleValue {
    pub fn new(replace: IpAddr, ifindex: u32) -> Self {
        RuleValue {
            replace,
            ifindex,
            packets: 0,
            bytes: 0,
        }
    }

    pub fn encode(&self) -> [u8; RULE_VALUE_LEN] {
        let mut data = [0u8; RULE_VALUE_LEN];
        encode_ip(self.replace, &mut data[..RULE_KEY_LEN]);
        data[20..24].copy_from_slice(&self.ifindex.to_le_bytes());
        data[24..32].copy_from_slice(&self.packets.to_le_bytes());
        data[32..40].copy_from_slice(&self.bytes.to_le_bytes());
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != RULE_VALUE_LEN {
            return Err(Error::ValueLength(data.len()));
        }
        Ok(RuleValue {
            replace: decode_ip(&data[..RULE_KEY_LEN])?,
            ifindex: u32::from_le_bytes(data[20..24].try_into().expect("slice length checked")),
            packets: u64::from_le_bytes(data[24..32].try_into().expect("slice length checked")),
            bytes: u64::from_le_bytes(data[32..40].try_into().expect("slice length checked")),
        })
    }
}

fn encode_ip(ip: IpAddr, data: &mut [u8]) {
    match ip {
        IpAddr::V4(v4) => {
            data[..2].copy_from_slice(&FAMILY_INET.to_le_bytes());
            data[4..8].copy_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            data[..2].copy_from_slice(&FAMILY_INET6.to_le_bytes());
            data[4..20].copy_from_slice(&v6.octets());
        }
    }
}

fn decode_ip(data: &[u8]) -> Result<IpAddr, Error> {
    let family = u16::from_le_bytes(data[..2].try_into().expect("slice length checked"));
    match family {
        FAMILY_INET => {
            let octets: [u8; 4] = data[4..8].try_into().expect("slice length checked");
            Ok(IpAddr::V4(octets.into()))
        }
        FAMILY_INET6 => {
            let octets: [u8; 16] = data[4..20].try_into().expect("slice length checked");
            Ok(IpAddr::V6(octets.into()))
        }
        other => Err(Error::UnknownFamily(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.40.0.2", "10.0.0.5", 7)]
    #[case("fd00:40::2", "fd00::5", 42)]
    #[case("192.0.2.1", "fd00::1", u32::MAX)]
    fn value_round_trips(#[case] key_ip: &str, #[case] replace: &str, #[case] ifindex: u32) {
        let key = RuleKey::new(key_ip.parse().unwrap());
        let value = RuleValue {
            replace: replace.parse().unwrap(),
            ifindex,
            packets: 123,
            bytes: 45678,
        };

        assert_eq!(RuleKey::decode(&key.encode()).unwrap(), key);
        assert_eq!(RuleValue::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn v4_key_layout_is_fixed() {
        let key = RuleKey::new("10.0.0.1".parse().unwrap());
        let data = key.encode();
        assert_eq!(&data[..2], &[2, 0]);
        assert_eq!(&data[2..4], &[0, 0]);
        assert_eq!(&data[4..8], &[10, 0, 0, 1]);
        assert!(data[8..].iter().all(|b| *b == 0));
    }

    #[rstest]
    #[case(0)]
    #[case(19)]
    #[case(21)]
    fn short_or_long_keys_are_rejected(#[case] len: usize) {
        let data = vec![0u8; len];
        assert_eq!(RuleKey::decode(&data), Err(Error::KeyLength(len)));
    }

    #[rstest]
    #[case(39)]
    #[case(41)]
    fn wrong_value_lengths_are_rejected(#[case] len: usize) {
        let data = vec![0u8; len];
        assert_eq!(RuleValue::decode(&data), Err(Error::ValueLength(len)));
    }

    #[test]
    fn unknown_family_is_an_error() {
        let mut data = [0u8; RULE_KEY_LEN];
        data[0] = 9;
        assert_eq!(RuleKey::decode(&data), Err(Error::UnknownFamily(9)));
    }
}
