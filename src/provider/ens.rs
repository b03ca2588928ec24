//! ENS reverse resolution helpers (namehash, calldata, ABI decoding).

use alloy_primitives::{keccak256, Address, B256};

/// ENS registry, same address on mainnet and testnets.
pub const ENS_REGISTRY: &str = "0x00000000000C2E074eC69A0dFb2997BA6C7d2e1e";

const RESOLVER_SELECTOR: &str = "0178b8bf";
const NAME_SELECTOR: &str = "691f3431";

pub fn namehash(name: &str) -> B256 {
    let mut node = B256::ZERO;
    if name.is_empty() {
        return node;
    }
    for label in name.rsplit('.') {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(node.as_slice());
        buf[32..].copy_from_slice(keccak256(label.as_bytes()).as_slice());
        node = keccak256(buf);
    }
    node
}

/// `<lowercase hex>.addr.reverse` for an address.
pub fn reverse_node_name(address: &Address) -> String {
    format!("{}.addr.reverse", hex::encode(address.as_slice()))
}

pub(crate) fn resolver_calldata(node: &B256) -> String {
    format!("0x{RESOLVER_SELECTOR}{}", hex::encode(node.as_slice()))
}

pub(crate) fn name_calldata(node: &B256) -> String {
    format!("0x{NAME_SELECTOR}{}", hex::encode(node.as_slice()))
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    hex::decode(raw.trim().trim_start_matches("0x")).ok()
}

/// Address in the low 20 bytes of a single ABI word. Zero address → `None`.
pub(crate) fn decode_abi_address(raw: &str) -> Option<Address> {
    let bytes = decode_hex(raw)?;
    if bytes.len() < 32 {
        return None;
    }
    let address = Address::from_slice(&bytes[12..32]);
    (address != Address::ZERO).then_some(address)
}

/// Decode an ABI-encoded dynamic `string` return value. Empty → `None`.
pub fn decode_abi_string(raw: &str) -> Option<String> {
    let bytes = decode_hex(raw)?;
    let offset = word_to_usize(bytes.get(0..32)?)?;
    let len = word_to_usize(bytes.get(offset..offset.checked_add(32)?)?)?;
    let start = offset + 32;
    let data = bytes.get(start..start.checked_add(len)?)?;
    let value = String::from_utf8(data.to_vec()).ok()?;
    (!value.is_empty()).then_some(value)
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..32]);
    usize::try_from(u64::from_be_bytes(low)).ok()
}
