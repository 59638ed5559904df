//! Symmetric chain ratchet for forward-secure message key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each index produces a unique message key
//! - Determinism: Same chain key always produces same key sequence

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC input for deriving the next chain key
const CHAIN_INPUT: &[u8] = &[0x02];

/// HMAC input for deriving a message key
const MESSAGE_INPUT: &[u8] = &[0x01];

/// A message key derived from a chain.
///
/// Used for exactly one message, then dropped.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    /// Rebuild a cached (skipped) message key.
    pub fn from_parts(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// 32-byte message key, expanded into AEAD material before use.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Position of this key in its chain.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure sending or receiving chain.
///
/// Each [`next_key()`](Self::next_key) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    /// Start a chain from the output of a root step.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Index of the next message key this chain will produce.
    ///
    /// Equal to the number of keys derived so far.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Derive the next message key and advance the chain.
    pub fn next_key(&mut self) -> Result<MessageKey, CryptoError> {
        if self.index == u32::MAX {
            return Err(CryptoError::ChainExhausted);
        }

        let message_key = self.hmac(MESSAGE_INPUT);
        let next_chain_key = self.hmac(CHAIN_INPUT);

        self.key.zeroize();
        self.key = next_chain_key;

        let index = self.index;
        self.index += 1;

        Ok(MessageKey { key: message_key, index })
    }

    /// Advance to `target`, returning keys for every skipped index and the key
    /// at `target` itself.
    ///
    /// Used for out-of-order messages. Fails without advancing when `target`
    /// is behind the chain or more than `max_skip` ahead of it.
    pub fn skip_to(
        &mut self,
        target: u32,
        max_skip: u32,
    ) -> Result<(Vec<MessageKey>, MessageKey), CryptoError> {
        if target < self.index {
            return Err(CryptoError::ReplayedMessage { index: target });
        }

        let skip = target - self.index;
        if skip > max_skip {
            return Err(CryptoError::TooManySkipped { skip, max: max_skip });
        }

        let mut skipped = Vec::with_capacity(skip as usize);
        while self.index < target {
            skipped.push(self.next_key()?);
        }
        let key = self.next_key()?;

        Ok((skipped, key))
    }

    /// Derive keys for every index up to (excluding) `end`.
    ///
    /// Used when a chain is being retired: messages still in flight on it can
    /// be decrypted later from the cache.
    pub fn skip_until(&mut self, end: u32, max_skip: u32) -> Result<Vec<MessageKey>, CryptoError> {
        if end <= self.index {
            return Ok(Vec::new());
        }

        let skip = end - self.index;
        if skip > max_skip {
            return Err(CryptoError::TooManySkipped { skip, max: max_skip });
        }

        let mut skipped = Vec::with_capacity(skip as usize);
        while self.index < end {
            skipped.push(self.next_key()?);
        }
        Ok(skipped)
    }

    fn hmac(&self, input: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(input);
        let result = mac.finalize().into_bytes();

        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain() -> ChainKey {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ChainKey::new(key)
    }

    #[test]
    fn new_chain_starts_at_index_zero() {
        assert_eq!(test_chain().index(), 0);
    }

    #[test]
    fn next_key_increments_index() {
        let mut chain = test_chain();

        let key0 = chain.next_key().unwrap();
        assert_eq!(key0.index(), 0);
        assert_eq!(chain.index(), 1);

        let key1 = chain.next_key().unwrap();
        assert_eq!(key1.index(), 1);
        assert_eq!(chain.index(), 2);
    }

    #[test]
    fn next_key_produces_unique_keys() {
        let mut chain = test_chain();

        let key0 = chain.next_key().unwrap();
        let key1 = chain.next_key().unwrap();
        let key2 = chain.next_key().unwrap();

        assert_ne!(key0.key(), key1.key(), "keys must be unique");
        assert_ne!(key1.key(), key2.key(), "keys must be unique");
        assert_ne!(key0.key(), key2.key(), "keys must be unique");
    }

    #[test]
    fn chain_is_deterministic() {
        let mut chain1 = test_chain();
        let mut chain2 = test_chain();

        for _ in 0..10 {
            let key1 = chain1.next_key().unwrap();
            let key2 = chain2.next_key().unwrap();
            assert_eq!(key1.key(), key2.key(), "same chain key must produce same keys");
        }
    }

    #[test]
    fn skip_to_returns_skipped_and_target() {
        let mut chain = test_chain();

        let (skipped, key) = chain.skip_to(5, 10).unwrap();
        assert_eq!(skipped.len(), 5);
        assert_eq!(skipped[0].index(), 0);
        assert_eq!(skipped[4].index(), 4);
        assert_eq!(key.index(), 5);
        assert_eq!(chain.index(), 6);
    }

    #[test]
    fn skip_to_matches_sequential_advance() {
        let mut sequential = test_chain();
        for _ in 0..5 {
            sequential.next_key().unwrap();
        }
        let key_sequential = sequential.next_key().unwrap();

        let mut skipping = test_chain();
        let (_, key_skip) = skipping.skip_to(5, 10).unwrap();

        assert_eq!(key_sequential.key(), key_skip.key(), "skip and sequential must agree");
    }

    #[test]
    fn skip_to_rejects_past_index() {
        let mut chain = test_chain();
        chain.skip_to(5, 10).unwrap();

        match chain.skip_to(3, 10) {
            Err(CryptoError::ReplayedMessage { index }) => assert_eq!(index, 3),
            _ => unreachable!("expected ReplayedMessage error"),
        }
    }

    #[test]
    fn skip_to_rejects_beyond_window_without_advancing() {
        let mut chain = test_chain();

        match chain.skip_to(100, 10) {
            Err(CryptoError::TooManySkipped { skip, max }) => {
                assert_eq!(skip, 100);
                assert_eq!(max, 10);
            },
            _ => unreachable!("expected TooManySkipped error"),
        }
        assert_eq!(chain.index(), 0);
    }

    #[test]
    fn skip_until_retires_remaining_keys() {
        let mut chain = test_chain();
        chain.next_key().unwrap();

        let skipped = chain.skip_until(4, 10).unwrap();
        assert_eq!(skipped.iter().map(MessageKey::index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(chain.skip_until(2, 10).unwrap().is_empty());
    }
}
