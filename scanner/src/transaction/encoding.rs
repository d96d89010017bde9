// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transfer payload encoding
//!
//! The payload follows the SCALE layout of an asset transfer extrinsic:
//!
//! ```text
//! call:    call_index(2) | compact(asset_id) | recipient(32) | compact(amount)
//! extra:   era | compact(nonce) | compact(tip)
//! signed:  spec_version(u32 le) | tx_version(u32 le) | genesis(32) | block(32)
//! ```
//!
//! The unsigned raw hex is `call | extra | signed` and the message handed to
//! the signer is its Keccak-256 digest.

use super::types::UnsignedTransfer;
use crate::error::{WalletError, WalletResult};
use sha3::{Digest, Keccak256};

const SIGNED_EXTRINSIC_V4: u8 = 0x84;
const SR25519_SIGNATURE: u8 = 0x01;
const MORTAL_ERA_PERIOD: u64 = 64;

/// Builds signable payloads and combines them with signatures.
pub trait TransactionEncoder: Send + Sync {
    /// Returns `(raw_hex, message)` for an unsigned transfer.
    fn encode_transfer(&self, transfer: &UnsignedTransfer) -> WalletResult<(String, String)>;

    /// Combine an unsigned payload with the signer's public key and
    /// signature into a submittable extrinsic.
    fn attach_signature(
        &self,
        raw_hex: &str,
        public_key: &str,
        signature: &str,
    ) -> WalletResult<String>;

    /// Public key behind a wallet address.
    fn decode_address(&self, address: &str) -> WalletResult<[u8; 32]> {
        decode_fixed::<32>(address).map_err(|e| WalletError::InvalidAddress(format!("{address}: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct CompactTransferEncoder {
    call_index: [u8; 2],
}

impl CompactTransferEncoder {
    pub fn new(call_index: [u8; 2]) -> Self {
        Self { call_index }
    }
}

impl Default for CompactTransferEncoder {
    fn default() -> Self {
        Self::new([0x04, 0x01])
    }
}

impl TransactionEncoder for CompactTransferEncoder {
    fn encode_transfer(&self, transfer: &UnsignedTransfer) -> WalletResult<(String, String)> {
        if transfer.amount == 0 {
            return Err(WalletError::InvalidAmount("zero amount".into()));
        }
        if transfer.asset_id == 0 {
            return Err(WalletError::CreateRawTransactionFailed("zero asset id".into()));
        }
        let genesis = decode_fixed::<32>(&transfer.genesis_hash).map_err(|e| {
            WalletError::CreateRawTransactionFailed(format!("genesis hash: {e}"))
        })?;
        let block = decode_fixed::<32>(&transfer.block_hash)
            .map_err(|e| WalletError::CreateRawTransactionFailed(format!("block hash: {e}")))?;

        let mut payload = self.call_index.to_vec();
        encode_compact(transfer.asset_id as u128, &mut payload);
        payload.extend_from_slice(&transfer.recipient_public_key);
        encode_compact(transfer.amount, &mut payload);

        payload.extend_from_slice(&mortal_era(MORTAL_ERA_PERIOD, transfer.era_height));
        encode_compact(transfer.nonce as u128, &mut payload);
        // tip
        encode_compact(0, &mut payload);

        payload.extend_from_slice(&transfer.spec_version.to_le_bytes());
        payload.extend_from_slice(&transfer.transaction_version.to_le_bytes());
        payload.extend_from_slice(&genesis);
        payload.extend_from_slice(&block);

        let message = hex::encode(Keccak256::digest(&payload));
        Ok((hex::encode(payload), message))
    }

    fn attach_signature(
        &self,
        raw_hex: &str,
        public_key: &str,
        signature: &str,
    ) -> WalletResult<String> {
        let invalid = |e: String| WalletError::CreateRawTransactionFailed(e);
        let payload = hex::decode(strip_0x(raw_hex)).map_err(|e| invalid(e.to_string()))?;
        let public_key = decode_fixed::<32>(public_key).map_err(invalid)?;
        let signature = decode_fixed::<64>(signature).map_err(invalid)?;

        let (call, extra) = split_payload(&payload).ok_or_else(|| invalid("malformed payload".into()))?;

        let mut body = vec![SIGNED_EXTRINSIC_V4];
        body.extend_from_slice(&public_key);
        body.push(SR25519_SIGNATURE);
        body.extend_from_slice(&signature);
        body.extend_from_slice(extra);
        body.extend_from_slice(call);

        let mut extrinsic = Vec::with_capacity(body.len() + 4);
        encode_compact(body.len() as u128, &mut extrinsic);
        extrinsic.extend_from_slice(&body);
        Ok(format!("0x{}", hex::encode(extrinsic)))
    }
}

/// Split an unsigned payload into its call and extra parts.
fn split_payload(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut pos = 2;
    pos += decode_compact(payload.get(pos..)?)?.1;
    pos += 32;
    pos += decode_compact(payload.get(pos..)?)?.1;
    let call_end = pos;

    pos += if *payload.get(pos)? == 0 { 1 } else { 2 };
    pos += decode_compact(payload.get(pos..)?)?.1;
    pos += decode_compact(payload.get(pos..)?)?.1;
    Some((&payload[..call_end], payload.get(call_end..pos)?))
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(strip_0x(s)).map_err(|e| e.to_string())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("expected {N} bytes, got {len}"))
}

/// Two byte mortal era anchored at `current`.
fn mortal_era(period: u64, current: u64) -> [u8; 2] {
    let period = period.next_power_of_two().clamp(4, 1 << 16);
    let phase = current % period;
    let quantize_factor = (period >> 12).max(1);
    let quantized_phase = phase / quantize_factor * quantize_factor;
    let encoded = (period.trailing_zeros() - 1).clamp(1, 15) as u16
        | ((quantized_phase / quantize_factor) << 4) as u16;
    encoded.to_le_bytes()
}

pub(crate) fn encode_compact(value: u128, out: &mut Vec<u8>) {
    match value {
        0..=0x3f => out.push((value as u8) << 2),
        0x40..=0x3fff => out.extend_from_slice(&(((value as u16) << 2) | 0b01).to_le_bytes()),
        0x4000..=0x3fff_ffff => {
            out.extend_from_slice(&(((value as u32) << 2) | 0b10).to_le_bytes())
        }
        _ => {
            let bytes = value.to_le_bytes();
            let len = 16 - (value.leading_zeros() / 8) as usize;
            out.push((((len - 4) as u8) << 2) | 0b11);
            out.extend_from_slice(&bytes[..len]);
        }
    }
}

/// Returns the decoded value and the number of bytes consumed.
pub(crate) fn decode_compact(input: &[u8]) -> Option<(u128, usize)> {
    let first = *input.first()?;
    match first & 0b11 {
        0b00 => Some(((first >> 2) as u128, 1)),
        0b01 => {
            let raw = u16::from_le_bytes(input.get(..2)?.try_into().ok()?);
            Some(((raw >> 2) as u128, 2))
        }
        0b10 => {
            let raw = u32::from_le_bytes(input.get(..4)?.try_into().ok()?);
            Some(((raw >> 2) as u128, 4))
        }
        _ => {
            let len = (first >> 2) as usize + 4;
            if len > 16 {
                return None;
            }
            let mut bytes = [0u8; 16];
            bytes[..len].copy_from_slice(input.get(1..=len)?);
            Some((u128::from_le_bytes(bytes), len + 1))
        }
    }
}
