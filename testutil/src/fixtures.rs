// Fixed identities shared by consensus and oracle tests

use alloy_primitives::Address;

/// Holds every role in test deployments
pub const ADMIN: Address = Address::repeat_byte(0xAA);

/// Identity of the consensus instance itself
pub const SELF_ADDRESS: Address = Address::repeat_byte(0xEE);

/// `n` committee members: 0x..01, 0x..02, ...
pub fn committee(n: u8) -> Vec<Address> {
    (1..=n).map(Address::with_last_byte).collect()
}

/// `n` attesters, disjoint from `committee`
pub fn attesters(n: u8) -> Vec<Address> {
    (1..=n)
        .map(|i| {
            let mut bytes = [0u8; 20];
            bytes[0] = 0xA7;
            bytes[19] = i;
            Address::from(bytes)
        })
        .collect()
}

/// A reserve subject (e.g. a qualified custodian)
pub fn subject(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x5B;
    bytes[19] = n;
    Address::from(bytes)
}
