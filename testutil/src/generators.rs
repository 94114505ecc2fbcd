// Test data generators

use alloy_primitives::{Address, U256};
use proptest::prelude::*;
use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Random non-empty operation payload
pub fn random_payload() -> Vec<u8> {
    let len = rand::thread_rng().gen_range(1..=64);
    random_bytes(len)
}

/// Random externally owned address (never zero)
pub fn random_address() -> Address {
    let mut rng = rand::thread_rng();
    let mut bytes: [u8; 20] = rng.gen();
    bytes[0] |= 1;
    Address::from(bytes)
}

/// Random balance within the attestable range
pub fn random_balance() -> U256 {
    U256::from(rand::thread_rng().gen_range(1..=u128::MAX))
}

pub fn arb_address() -> impl Strategy<Value = Address> {
    any::<[u8; 20]>().prop_map(|mut bytes| {
        bytes[0] |= 1;
        Address::from(bytes)
    })
}

pub fn arb_payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len.max(1))
}

/// Balances clustered around `center` within `spread` percent
pub fn arb_balances_near(center: u64, spread: u64, count: usize) -> impl Strategy<Value = Vec<U256>> {
    let delta = center * spread / 100;
    prop::collection::vec((center - delta)..=(center + delta), count)
        .prop_map(|values| values.into_iter().map(U256::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_values_are_usable() {
        assert_ne!(random_address(), Address::ZERO);
        assert!(!random_payload().is_empty());
        assert!(random_balance() > U256::ZERO);
    }

    proptest! {
        #[test]
        fn prop_balances_stay_in_band(values in arb_balances_near(1_000, 5, 4)) {
            prop_assert_eq!(values.len(), 4);
            for v in values {
                prop_assert!(v >= U256::from(950u64) && v <= U256::from(1_050u64));
            }
        }
    }
}
